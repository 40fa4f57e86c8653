use super::preprocess::Preprocessor;
use super::types::{BackgroundRemover, Matte};
use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, ValueType};
use std::path::{Path, PathBuf};

/// Input resolution of the u2net family of saliency models
const MODEL_INPUT_SIZE: u32 = 320;

fn ort_error(err: impl std::fmt::Display) -> anyhow::Error {
    anyhow!("{}", err)
}

/// Single-input, single-output saliency model run through ONNX Runtime
///
/// Models are looked up as `<models_dir>/<model_name>.onnx`. The session is
/// reloaded if a batch asks for a different model than the one loaded.
/// Models exported with a dynamic batch dimension get a whole batch per run;
/// fixed-batch models are run once per frame.
pub struct OnnxRemover {
    models_dir: PathBuf,
    model_name: String,
    model: LoadedModel,
    preprocessor: Preprocessor,
}

struct LoadedModel {
    session: Session,
    input_name: String,
    output_name: String,
    dynamic_batch: bool,
}

impl OnnxRemover {
    pub fn open<P: AsRef<Path>>(models_dir: P, model_name: &str) -> Result<Self> {
        let models_dir = models_dir.as_ref().to_path_buf();
        let model = load_model(&models_dir, model_name)?;

        Ok(Self {
            models_dir,
            model_name: model_name.to_string(),
            model,
            preprocessor: Preprocessor::new(MODEL_INPUT_SIZE, MODEL_INPUT_SIZE),
        })
    }

    fn ensure_model(&mut self, model_name: &str) -> Result<()> {
        if self.model_name != model_name {
            tracing::info!("Switching model {} -> {}", self.model_name, model_name);
            self.model = load_model(&self.models_dir, model_name)?;
            self.model_name = model_name.to_string();
        }
        Ok(())
    }

    /// Run one session call over `frames`, all stacked along the batch axis
    fn segment(&mut self, frames: &[RgbImage]) -> Result<Vec<Matte>> {
        let _span = tracing::debug_span!("onnx_segment", frames = frames.len()).entered();

        let input = Tensor::from_array(self.preprocessor.preprocess_batch(frames)).map_err(ort_error)?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .model
            .session
            .run(ort::inputs![self.model.input_name.as_str() => input])
            .map_err(ort_error)
            .context("Failed to run inference")?;
        drop(_infer_span);

        // Mask shape is [N, 1, H, W]; take the trailing two dims
        let (shape, masks) = outputs[self.model.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(ort_error)?;
        let dims: &[i64] = shape;
        if dims.len() < 2 {
            bail!("Unexpected mask shape {:?}", dims);
        }
        let mask_height = dims[dims.len() - 2] as u32;
        let mask_width = dims[dims.len() - 1] as u32;
        let plane = mask_width as usize * mask_height as usize;
        if plane == 0 || masks.len() != plane * frames.len() {
            bail!(
                "Model returned {} mask values for {} frames of {}x{}",
                masks.len(),
                frames.len(),
                mask_width,
                mask_height
            );
        }

        masks
            .chunks(plane)
            .zip(frames)
            .map(|(mask, frame)| {
                let (frame_width, frame_height) = frame.dimensions();
                Preprocessor::postprocess_mask(mask, mask_width, mask_height, frame_width, frame_height)
            })
            .collect()
    }
}

fn load_model(models_dir: &Path, model_name: &str) -> Result<LoadedModel> {
    let path = models_dir.join(format!("{}.onnx", model_name));

    tracing::info!("Loading model {} from {}", model_name, path.display());

    let session = Session::builder()
        .map_err(ort_error)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(ort_error)?
        .with_intra_threads(4)
        .map_err(ort_error)?
        .commit_from_file(&path)
        .map_err(ort_error)
        .with_context(|| format!("Failed to load model from {}", path.display()))?;

    let input = session
        .inputs
        .first()
        .ok_or_else(|| anyhow!("Model {} has no inputs", model_name))?;
    let input_name = input.name.clone();
    let dynamic_batch = match &input.input_type {
        ValueType::Tensor { shape, .. } => shape.first().is_some_and(|&dim| dim < 0),
        _ => false,
    };
    let output_name = session
        .outputs
        .first()
        .map(|output| output.name.clone())
        .ok_or_else(|| anyhow!("Model {} has no outputs", model_name))?;

    tracing::debug!(
        "Model {} input={} output={} dynamic_batch={}",
        model_name,
        input_name,
        output_name,
        dynamic_batch
    );

    Ok(LoadedModel {
        session,
        input_name,
        output_name,
        dynamic_batch,
    })
}

impl BackgroundRemover for OnnxRemover {
    fn remove_many(&mut self, frames: Vec<RgbImage>, model_name: &str) -> Result<Vec<Matte>> {
        self.ensure_model(model_name)?;
        if self.model.dynamic_batch {
            return self.segment(&frames);
        }

        let mut mattes = Vec::with_capacity(frames.len());
        for frame in frames.chunks(1) {
            mattes.extend(self.segment(frame)?);
        }
        Ok(mattes)
    }
}
