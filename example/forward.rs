use burn::{backend::NdArray, prelude::*};

use burn_vit::model::vit::{pair, ViTConfig};

fn main() -> burn_vit::Result<()> {
    let device = Default::default();

    let config = ViTConfig::new(pair(32), pair(8), 10, 64, 2, 4, 128).with_dim_head(16);
    let vit = config.init::<NdArray<f32>>(&device)?;

    let input: Tensor<NdArray<f32>, 4> = Tensor::zeros(
        [2, config.channels, config.image_size[0], config.image_size[1]],
        &device,
    );
    let logits = vit.forward(input)?;
    println!("logits: {:?}", logits.dims());

    Ok(())
}
