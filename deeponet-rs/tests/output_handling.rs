//! Output handling integration tests.
//!
//! Every variant is wired into a full model and checked for layout,
//! output shapes and the strategy pairs it refuses.

use candle_core::{DType, Device, Tensor};
use deeponet_rs::{
    DeepONet, DeepOnetConfig, DeepOnetError, Objective, OutputHandling, OutputHandlingKind,
    StandardTraining, TrainingStrategyKind,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn config(kind: OutputHandlingKind) -> DeepOnetConfig {
    DeepOnetConfig::default()
        .with_output_handling(kind)
        .with_basis_functions(4)
        .with_layers(vec![3, 16], vec![1, 16])
}

fn build(config: &DeepOnetConfig) -> deeponet_rs::Result<DeepONet> {
    let objective = Objective::new(
        config.loss_function,
        config.output_keys.clone(),
        config.error_norm,
    );
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    DeepONet::new(
        config,
        StandardTraining::new(objective).into(),
        &Device::Cpu,
        &mut rng,
    )
}

fn inputs(batch: usize, points: usize) -> (Tensor, Tensor) {
    let device = Device::Cpu;
    let xb: Vec<f32> = (0..batch * 3).map(|i| (i as f32 * 0.37).sin()).collect();
    let xt: Vec<f32> = (0..points).map(|i| i as f32 / points as f32).collect();
    (
        Tensor::from_vec(xb, (batch, 3), &device).unwrap(),
        Tensor::from_vec(xt, (points, 1), &device).unwrap(),
    )
}

#[test]
fn test_every_variant_produces_one_field_per_output() {
    let (xb, xt) = inputs(5, 9);
    for kind in [
        OutputHandlingKind::ShareTrunk,
        OutputHandlingKind::SplitNetworks,
        OutputHandlingKind::ShareBranch,
    ] {
        let model = build(&config(kind)).unwrap();
        let outputs = model.forward(Some(&xb), Some(&xt)).unwrap();
        assert_eq!(outputs.len(), 2, "{kind}");
        for out in &outputs {
            assert_eq!(out.dims(), &[5, 9], "{kind}");
        }
    }
}

#[test]
fn test_model_widths_follow_layout() {
    let model = build(&config(OutputHandlingKind::ShareTrunk)).unwrap();
    assert_eq!(model.parts().branch.output_size(), 8);
    assert_eq!(model.parts().trunk.output_size(), 4);

    let model = build(&config(OutputHandlingKind::SplitNetworks)).unwrap();
    assert_eq!(model.parts().branch.output_size(), 8);
    assert_eq!(model.parts().trunk.output_size(), 8);

    let model = build(&config(OutputHandlingKind::ShareBranch)).unwrap();
    assert_eq!(model.parts().branch.output_size(), 4);
    assert_eq!(model.parts().trunk.output_size(), 8);
    assert_eq!(model.output_layout().n_trunk_outputs, 2);
}

#[test]
fn test_share_branch_with_two_step_is_rejected() {
    let err = OutputHandling::configure(
        OutputHandlingKind::ShareBranch,
        TrainingStrategyKind::TwoStep,
        4,
        2,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, DeepOnetError::IncompatibleStrategies { .. }));
    assert!(err.is_configuration());

    // The same pair is refused when validating a config.
    let config = config(OutputHandlingKind::ShareBranch)
        .with_training_strategy(TrainingStrategyKind::TwoStep);
    assert!(config.validate().is_err());
}

#[test]
fn test_share_trunk_outputs_are_independent_branch_slices() {
    let device = Device::Cpu;
    let oh = OutputHandling::configure(
        OutputHandlingKind::ShareTrunk,
        TrainingStrategyKind::Standard,
        2,
        2,
        None,
    )
    .unwrap();
    // Second slice of the branch is zero, so the second output is zero.
    let branch = Tensor::new(&[[1.0f32, 2.0, 0.0, 0.0]], &device).unwrap();
    let trunk = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0]], &device).unwrap();
    let outputs = oh.forward(&branch, Some(&trunk)).unwrap();

    assert_eq!(outputs[0].to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0, 3.0]]);
    assert_eq!(outputs[1].to_vec2::<f32>().unwrap(), vec![vec![0.0, 0.0, 0.0]]);
}

#[test]
fn test_missing_trunk_means_identity() {
    let device = Device::Cpu;
    for kind in [
        OutputHandlingKind::ShareTrunk,
        OutputHandlingKind::SplitNetworks,
    ] {
        let oh =
            OutputHandling::configure(kind, TrainingStrategyKind::Standard, 3, 2, None).unwrap();
        let branch = Tensor::arange(0f32, 12.0, &device)
            .unwrap()
            .reshape((2, 6))
            .unwrap();
        let outputs = oh.forward(&branch, None).unwrap();
        // B_i · Iᵀ = B_i.
        for (i, out) in outputs.iter().enumerate() {
            let expected = branch.narrow(1, i * 3, 3).unwrap();
            let diff = (out - &expected)
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-6, "{kind} output {i}");
        }
    }
}

#[test]
fn test_forward_rejects_wrong_trunk_width() {
    let device = Device::Cpu;
    let oh = OutputHandling::configure(
        OutputHandlingKind::SplitNetworks,
        TrainingStrategyKind::Standard,
        4,
        2,
        None,
    )
    .unwrap();
    let branch = Tensor::zeros((3, 8), DType::F32, &device).unwrap();
    let trunk = Tensor::zeros((5, 4), DType::F32, &device).unwrap();
    let err = oh.forward(&branch, Some(&trunk)).unwrap_err();
    assert!(matches!(err, DeepOnetError::ShapeMismatch { .. }));
}
