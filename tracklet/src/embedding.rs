use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use log::{debug, warn};
#[cfg(test)]
use mockall::automock;
use opencv::{
    core::{CV_32FC3, Mat, MatTraitConst, MatTraitConstManual, Rect, Size, Vector, transpose_nd},
    imgproc::{COLOR_BGR2RGB, INTER_LINEAR, cvt_color_def, resize},
};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{Session, SessionInputValue},
    value::TensorRef,
};

use crate::{
    region::ObjectType,
    settings::EmbeddingConfig,
    track::clamp_to_frame,
};

/// Appearance model producing an embedding vector for a region crop.
///
/// `embed` is called only from the single-threaded extraction phase of an
/// update, so implementations may serialize internally.
#[cfg_attr(test, automock)]
pub trait EmbeddingBackend: fmt::Debug + Send + Sync {
    fn embed(&self, crop: &Mat) -> Result<Vec<f32>>;
}

/// ONNX-backed embedding model.
pub struct OrtEmbedding {
    session: Mutex<Session>,
    input_size: Size,
    output_name: String,
}

impl fmt::Debug for OrtEmbedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrtEmbedding")
            .field("input_size", &self.input_size)
            .field("output_name", &self.output_name)
            .finish_non_exhaustive()
    }
}

impl OrtEmbedding {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let session = if cfg!(feature = "gpu") {
            Session::builder()?
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(&config.model)?
        } else {
            Session::builder()?.commit_from_file(&config.model)?
        };
        Ok(Self {
            session: Mutex::new(session),
            input_size: Size::new(config.input_size.0, config.input_size.1),
            output_name: config.output_name.clone(),
        })
    }

    /// Converts a BGR crop to a continuous, normalized `f32` RGB image of the
    /// network input size.
    fn preprocess(&self, crop: &Mat) -> Result<Mat> {
        let mut rgb = Mat::default();
        cvt_color_def(crop, &mut rgb, COLOR_BGR2RGB)?;
        let mut resized = Mat::default();
        resize(&rgb, &mut resized, self.input_size, 0.0, 0.0, INTER_LINEAR)?;
        let mut float = Mat::default();
        resized.convert_to(&mut float, CV_32FC3, 1.0 / 255.0, 0.0)?;
        Ok(float)
    }
}

impl EmbeddingBackend for OrtEmbedding {
    fn embed(&self, crop: &Mat) -> Result<Vec<f32>> {
        let mat = self.preprocess(crop)?;
        let mat = mat.reshape_nd(1, &[1, mat.rows(), mat.cols(), 3])?;
        let mut mat_t = Mat::default();
        transpose_nd(&mat, &Vector::from_slice(&[0, 3, 1, 2]), &mut mat_t)?;
        let shape = mat_t.mat_size();
        let tensor = TensorRef::from_array_view((shape.as_slice(), mat_t.data_typed::<f32>()?))?;

        let mut session = self.session.lock().expect("embedding session lock");
        let outputs = session.run([SessionInputValue::Owned(tensor.clone().into_dyn())])?;
        let (_, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        Ok(data.to_vec())
    }
}

/// Shared embedding backends indexed by object type.
///
/// Several types may route to the same backend instance. Types without a
/// backend produce no embedding and the cosine distance term skips them.
#[derive(Debug, Default)]
pub struct EmbeddingRegistry {
    backends: HashMap<ObjectType, Arc<dyn EmbeddingBackend>>,
}

impl EmbeddingRegistry {
    /// Initializes one backend per config entry.
    ///
    /// A backend that fails to initialize is reported once and its types stay
    /// unregistered; this is never fatal.
    pub fn from_configs(configs: &[EmbeddingConfig]) -> Self {
        let mut registry = Self::default();
        for config in configs {
            match OrtEmbedding::new(config) {
                Ok(backend) => registry.register(&config.object_types, Arc::new(backend)),
                Err(err) => warn!(
                    "embedding backend {:?} for {:?} failed to initialize, \
                     cosine distance disabled for these types: {err}",
                    config.model, config.object_types
                ),
            }
        }
        registry
    }

    pub fn register(&mut self, object_types: &[ObjectType], backend: Arc<dyn EmbeddingBackend>) {
        for object_type in object_types {
            self.backends.insert(*object_type, Arc::clone(&backend));
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Embeds `frame[brect]` with the backend registered for `object_type`.
    ///
    /// Returns `None` when no backend covers the type or extraction fails;
    /// failures degrade to a skipped cosine term.
    pub fn extract(&self, frame: &Mat, brect: Rect, object_type: ObjectType) -> Option<Vec<f32>> {
        let backend = self.backends.get(&object_type)?;
        let frame_size = frame.size().ok()?;
        let roi_rect = clamp_to_frame(brect, frame_size);
        if roi_rect.width <= 0 || roi_rect.height <= 0 {
            return None;
        }
        let crop = frame.roi(roi_rect).ok()?.try_clone().ok()?;
        match backend.embed(&crop) {
            Ok(embedding) => Some(embedding),
            Err(err) => {
                debug!("embedding extraction failed for {object_type}: {err}");
                None
            }
        }
    }
}
