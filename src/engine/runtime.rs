//! OpenVINO runtime plumbing
//!
//! Models are read and compiled eagerly when a provider is constructed;
//! nothing here reloads or unloads a network mid-process.

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use ndarray::Array4;
use openvino::{CompiledModel, Core, ElementType, InferRequest, Shape, Tensor};
use tracing::info;

/// Wrapper for OpenVINO Core that implements Send + Sync.
pub struct SafeCore(Core);
unsafe impl Send for SafeCore {}
unsafe impl Sync for SafeCore {}

impl Deref for SafeCore {
    type Target = Core;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync.
#[derive(Clone)]
pub struct SafeCompiledModel(Arc<CompiledModel>);
unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

impl SafeCompiledModel {
    /// Create an inference request.
    /// OpenVINO CompiledModel methods are thread-safe in C++, but the Rust
    /// bindings require &mut self. We bypass that restriction safely.
    pub fn create_infer_request(&self) -> Result<InferRequest> {
        unsafe {
            let ptr = Arc::as_ptr(&self.0) as *mut CompiledModel;
            (*ptr).create_infer_request().map_err(|e| e.into())
        }
    }
}

/// Owns the OpenVINO core and compiles networks for one device.
pub struct ModelRuntime {
    core: SafeCore,
    device: String,
}

impl ModelRuntime {
    pub fn new(device: &str) -> Result<Self> {
        let core = Core::new().context("Failed to initialize OpenVINO core")?;
        Ok(Self {
            core: SafeCore(core),
            device: device.to_string(),
        })
    }

    /// Read and compile a network from disk.
    pub fn load(&mut self, name: &str, path: &Path) -> Result<SafeCompiledModel> {
        let start = Instant::now();
        let path_str = path.to_str().with_context(|| {
            format!("{} model path is not valid UTF-8: {}", name, path.display())
        })?;
        let model = self
            .core
            .0
            .read_model_from_file(path_str, "")
            .with_context(|| format!("Failed to read {} model from {}", name, path.display()))?;
        let compiled = self
            .core
            .0
            .compile_model(&model, self.device.as_str().into())
            .with_context(|| format!("Failed to compile {} model for {}", name, self.device))?;
        info!("Model {} compiled from {} in {:?}", name, path.display(), start.elapsed());
        Ok(SafeCompiledModel(Arc::new(compiled)))
    }
}

/// Copy an NCHW f32 array into the request's input tensor.
pub fn set_input(request: &mut InferRequest, data: &Array4<f32>) -> Result<()> {
    let dims: Vec<i64> = data.shape().iter().map(|&d| d as i64).collect();
    let shape = Shape::new(&dims)?;
    let mut input = Tensor::new(ElementType::F32, &shape)?;

    let flat = data
        .as_slice()
        .context("input tensor is not contiguous")?;
    unsafe {
        let tensor_data = input.get_raw_data_mut()?.as_mut_ptr() as *mut f32;
        std::ptr::copy_nonoverlapping(flat.as_ptr(), tensor_data, flat.len());
    }

    request.set_input_tensor(&input)?;
    Ok(())
}

/// Read a whole output tensor as an f32 vector.
pub fn read_tensor_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    let shape = tensor.get_shape()?;
    let total: i64 = shape.get_dimensions().iter().product();
    let data = unsafe {
        let ptr = tensor.get_raw_data()?.as_ptr() as *const f32;
        std::slice::from_raw_parts(ptr, total as usize).to_vec()
    };
    Ok(data)
}

/// Read the request's single output as an f32 vector.
pub fn read_output_f32(request: &InferRequest) -> Result<Vec<f32>> {
    let output = request.get_output_tensor()?;
    read_tensor_f32(&output)
}
