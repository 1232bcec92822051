use burn::{nn::Initializer, prelude::*};

#[derive(Config, Debug)]
pub struct MlpConfig {
    pub in_features: usize,
    pub hidden_features: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl MlpConfig {
    pub fn init<B: Backend, const D: usize>(&self, device: &B::Device) -> Mlp<B, D> {
        Mlp::new(device, self.clone())
    }
}

/// Position-wise expansion, GELU, contraction; dropout after each linear.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend, const D: usize> {
    pub act: nn::Gelu,
    pub dropout: nn::Dropout,
    pub fc1: nn::Linear<B>,
    pub fc2: nn::Linear<B>,
}

impl<B: Backend, const D: usize> Mlp<B, D> {
    fn new(device: &B::Device, config: MlpConfig) -> Self {
        let fc1 = nn::LinearConfig::new(config.in_features, config.hidden_features)
            .with_initializer(Initializer::Zeros)
            .init(device);

        let fc2 = nn::LinearConfig::new(config.hidden_features, config.in_features)
            .with_initializer(Initializer::Zeros)
            .init(device);

        let act = nn::Gelu::new();
        let dropout = nn::DropoutConfig::new(config.dropout).init();

        Self {
            act,
            dropout,
            fc1,
            fc2,
        }
    }

    pub fn forward(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let x = self.fc1.forward(x);
        let x = self.act.forward(x);
        let x = self.dropout.forward(x);
        let x = self.fc2.forward(x);
        self.dropout.forward(x)
    }
}

#[cfg(all(test, feature = "backend_ndarray"))]
mod tests {
    use super::*;
    use burn::{backend::Autodiff, tensor::Distribution};

    type TestBackend = burn::backend::NdArray<f32>;
    type TrainBackend = Autodiff<TestBackend>;

    fn randomized<B: Backend>(config: &MlpConfig, device: &B::Device) -> Mlp<B, 3> {
        let mut mlp = config.init::<B, 3>(device);
        mlp.fc1.weight = mlp.fc1.weight.map(|w| {
            let shape = w.shape();
            Tensor::random(shape, Distribution::Normal(0.0, 1.0), device)
        });
        mlp.fc2.weight = mlp.fc2.weight.map(|w| {
            let shape = w.shape();
            Tensor::random(shape, Distribution::Normal(0.0, 1.0), device)
        });
        mlp
    }

    #[test]
    fn contracts_back_to_input_width() {
        let device = Default::default();
        let mlp = MlpConfig::new(64, 128).init::<TestBackend, 3>(&device);

        let x = Tensor::<TestBackend, 3>::ones([2, 17, 64], &device);
        assert_eq!(mlp.forward(x).dims(), [2, 17, 64]);
        assert_eq!(mlp.num_params(), 64 * 128 + 128 + 128 * 64 + 64);
    }

    #[test]
    fn dropout_is_identity_during_inference() {
        let device = Default::default();
        let mlp = randomized::<TestBackend>(&MlpConfig::new(8, 32).with_dropout(0.5), &device);

        let x = Tensor::<TestBackend, 3>::random([2, 5, 8], Distribution::Normal(0.0, 1.0), &device);
        let first = mlp.forward(x.clone()).into_data().to_vec::<f32>().unwrap();
        let second = mlp.forward(x).into_data().to_vec::<f32>().unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn dropout_is_active_during_training() {
        let device = Default::default();
        let mlp = randomized::<TrainBackend>(&MlpConfig::new(8, 32).with_dropout(0.5), &device);

        let x = Tensor::<TrainBackend, 3>::random([4, 16, 8], Distribution::Normal(0.0, 1.0), &device);
        let first = mlp.forward(x.clone()).into_data().to_vec::<f32>().unwrap();
        let second = mlp.forward(x).into_data().to_vec::<f32>().unwrap();

        assert_ne!(first, second);
    }
}
