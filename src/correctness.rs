use std::{fs, path::Path};

use burn::{
    module::Module,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::Tensor,
};
use safetensors::{
    tensor::{SafeTensors, TensorView},
    Dtype,
};

use crate::{
    error::{Result, VitError},
    model::vit::{ViT, ViTConfig},
};

/// Input batch and expected encoder output produced by a reference
/// implementation, stored as `network_input` and `output` in a safetensors file.
#[derive(Debug)]
pub struct CorrectnessReference {
    pub network_input: Vec<f32>,
    pub network_input_shape: [usize; 4],
    pub output: Vec<f32>,
    pub output_shape: [usize; 2],
}

impl CorrectnessReference {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let tensors = SafeTensors::deserialize(bytes)?;

        let (network_input, network_input_shape) = read_tensor::<4>(&tensors, "network_input")?;
        let (output, output_shape) = read_tensor::<2>(&tensors, "output")?;

        Ok(Self {
            network_input,
            network_input_shape,
            output,
            output_shape,
        })
    }

    /// Rebuilds the input batch, checking its length against the recorded shape.
    pub fn input<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B, 4>> {
        check_len("network_input", &self.network_input, &self.network_input_shape)?;

        Ok(Tensor::<B, 1>::from_floats(self.network_input.as_slice(), device)
            .reshape(self.network_input_shape))
    }
}

#[derive(Debug)]
pub struct MetricStats {
    pub mean_abs: f32,
    pub max_abs: f32,
    pub max_rel: f32,
    pub mse: f32,
}

impl MetricStats {
    pub fn within_defaults(&self) -> bool {
        self.max_abs <= OUTPUT_MAX_ABS
            && self.mse <= OUTPUT_MSE
            && self.mean_abs <= OUTPUT_MEAN_ABS
    }
}

pub const OUTPUT_MAX_ABS: f32 = 1e-2;
pub const OUTPUT_MEAN_ABS: f32 = 3e-3;
pub const OUTPUT_MSE: f32 = 1e-3;

/// Builds an encoder from `config` and loads trained parameters saved with
/// [`NamedMpkFileRecorder`].
pub fn load_model_from_checkpoint<B: Backend>(
    config: &ViTConfig,
    checkpoint_path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<ViT<B>> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let model = config
        .init::<B>(device)?
        .load_file(checkpoint_path.as_ref().to_path_buf(), &recorder, device)?;

    Ok(model)
}

pub fn save_checkpoint<B: Backend>(model: ViT<B>, checkpoint_path: impl AsRef<Path>) -> Result<()> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model.save_file(checkpoint_path.as_ref().to_path_buf(), &recorder)?;
    Ok(())
}

pub fn run_correctness<B: Backend>(
    model: &ViT<B>,
    reference: &CorrectnessReference,
    device: &B::Device,
) -> Result<MetricStats> {
    let output = model.forward(reference.input(device)?)?;
    let actual = tensor_to_vec(output)?;

    if actual.len() != reference.output.len() {
        return Err(VitError::LengthMismatch {
            tensor: "output",
            expected: reference.output.len(),
            actual: actual.len(),
        });
    }

    let stats = compute_stats(&actual, &reference.output);
    tracing::debug!(
        mean_abs = stats.mean_abs,
        max_abs = stats.max_abs,
        mse = stats.mse,
        "compared encoder output against reference"
    );

    Ok(stats)
}

fn compute_stats(actual: &[f32], expected: &[f32]) -> MetricStats {
    let mut sum_abs = 0.0f32;
    let mut max_abs = 0.0f32;
    let mut max_rel = 0.0f32;
    let mut mse = 0.0f32;

    for (&lhs, &rhs) in actual.iter().zip(expected.iter()) {
        let diff = lhs - rhs;
        let abs = diff.abs();
        sum_abs += abs;
        max_abs = max_abs.max(abs);
        if rhs.abs() > f32::EPSILON {
            max_rel = max_rel.max(abs / rhs.abs());
        }
        mse += diff.powi(2);
    }

    let len = actual.len().max(1) as f32;
    MetricStats {
        mean_abs: sum_abs / len,
        max_abs,
        max_rel,
        mse: mse / len,
    }
}

fn read_tensor<const D: usize>(
    tensors: &SafeTensors<'_>,
    name: &'static str,
) -> Result<(Vec<f32>, [usize; D])> {
    let view = tensors
        .tensor(name)
        .map_err(|_| VitError::MissingTensor(name))?;
    let shape: [usize; D] = view
        .shape()
        .try_into()
        .map_err(|_| VitError::UnexpectedRank {
            tensor: name,
            expected: D,
            actual: view.shape().len(),
        })?;

    if view.dtype() != Dtype::F32 {
        return Err(VitError::UnexpectedDtype {
            tensor: name,
            actual: format!("{:?}", view.dtype()),
        });
    }

    let values = tensor_view_to_vec(&view);
    check_len(name, &values, &shape)?;

    Ok((values, shape))
}

fn check_len(tensor: &'static str, values: &[f32], shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if values.len() != expected {
        return Err(VitError::LengthMismatch {
            tensor,
            expected,
            actual: values.len(),
        });
    }
    Ok(())
}

fn tensor_view_to_vec(view: &TensorView<'_>) -> Vec<f32> {
    view.data()
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| VitError::TensorData(format!("{err:?}")))
}
