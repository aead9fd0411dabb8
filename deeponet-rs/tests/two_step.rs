//! Two-step training integration tests.
//!
//! # Test Coverage
//!
//! 1. **Phase guards**: branch phase refused before the decomposition
//! 2. **Decomposition**: orthonormal trained trunk that reproduces the trunk output
//! 3. **Trainability**: which slots and whether `A` receive updates per phase
//! 4. **Compatibility**: `share_branch` refused at model construction
//! 5. **Basis change**: branch-phase targets fused with the trained trunk
//!    reproduce the trunk-phase prediction

use candle_core::{DType, Device, Tensor};
use deeponet_rs::linalg;
use deeponet_rs::network::kaiming_uniform;
use deeponet_rs::{
    DecompositionHelper, DecompositionKind, DeepONet, DeepOnetBatch, DeepOnetConfig,
    DeepOnetError, Mlp, Objective, OutputHandlingKind, TrainingStrategyKind, TwoStepPhase,
    TwoStepTraining,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const N_SAMPLES: usize = 6;
const N_POINTS: usize = 10;

fn config(kind: OutputHandlingKind) -> DeepOnetConfig {
    DeepOnetConfig::default()
        .with_output_handling(kind)
        .with_training_strategy(TrainingStrategyKind::TwoStep)
        .with_basis_functions(4)
        .with_layers(vec![3, 16], vec![1, 16])
}

fn batch() -> DeepOnetBatch {
    let device = Device::Cpu;
    let xb: Vec<f32> = (0..N_SAMPLES * 3).map(|i| (i as f32 * 0.41).cos()).collect();
    let xt: Vec<f32> = (0..N_POINTS).map(|i| i as f32 / (N_POINTS - 1) as f32).collect();
    let real: Vec<f32> = (0..N_SAMPLES * N_POINTS)
        .map(|i| {
            let (s, p) = (i / N_POINTS, i % N_POINTS);
            (s as f32 + 1.0) * 0.2 * xt[p]
        })
        .collect();
    let imag: Vec<f32> = real.iter().map(|v| 1.0 - v).collect();

    DeepOnetBatch::new(
        Some(Tensor::from_vec(xb, (N_SAMPLES, 3), &device).unwrap()),
        Some(Tensor::from_vec(xt, (N_POINTS, 1), &device).unwrap()),
    )
    .with_target(
        "g_u_real",
        Tensor::from_vec(real, (N_SAMPLES, N_POINTS), &device).unwrap(),
    )
    .with_target(
        "g_u_imag",
        Tensor::from_vec(imag, (N_SAMPLES, N_POINTS), &device).unwrap(),
    )
}

fn build(config: &DeepOnetConfig, kind: DecompositionKind) -> deeponet_rs::Result<DeepONet> {
    let objective = Objective::new(
        config.loss_function,
        config.output_keys.clone(),
        config.error_norm,
    );
    let strategy = TwoStepTraining::new(
        objective,
        DecompositionHelper::new(kind),
        N_SAMPLES,
        TwoStepPhase::Trunk,
    );
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    DeepONet::new(config, strategy.into(), &Device::Cpu, &mut rng)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_keepdim(0)
        .unwrap()
        .max_keepdim(1)
        .unwrap()
        .to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()[0]
}

#[test]
fn test_branch_phase_requires_decomposition() {
    let mut model = build(&config(OutputHandlingKind::ShareTrunk), DecompositionKind::Qr).unwrap();
    assert_eq!(model.phase(), Some(TwoStepPhase::Trunk));

    let err = model.update_training_phase(TwoStepPhase::Branch).unwrap_err();
    assert!(matches!(err, DeepOnetError::MissingBasisChange { .. }));
    assert_eq!(model.phase(), Some(TwoStepPhase::Trunk));

    let batch = batch();
    model.compute_trained_trunk(batch.trunk_input().unwrap()).unwrap();
    model.update_training_phase(TwoStepPhase::Branch).unwrap();
    assert_eq!(model.phase(), Some(TwoStepPhase::Branch));
}

#[test]
fn test_branch_loss_before_decomposition_fails() {
    let config = config(OutputHandlingKind::ShareTrunk);
    let objective = Objective::new(
        config.loss_function,
        config.output_keys.clone(),
        config.error_norm,
    );
    let strategy = TwoStepTraining::new(
        objective,
        DecompositionHelper::new(DecompositionKind::Qr),
        N_SAMPLES,
        TwoStepPhase::Branch,
    );
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut model = DeepONet::new(&config, strategy.into(), &Device::Cpu, &mut rng).unwrap();
    assert_eq!(model.phase(), Some(TwoStepPhase::Branch));

    let batch = batch();
    let err = model.compute_loss(&batch).unwrap_err();
    assert!(matches!(err, DeepOnetError::MissingBasisChange { .. }));
    let err = model.compute_errors(&batch).unwrap_err();
    assert!(matches!(err, DeepOnetError::MissingBasisChange { .. }));

    // The trunk slot still holds the network, so R can be computed late.
    model.compute_trained_trunk(batch.trunk_input().unwrap()).unwrap();
    let errors = model.compute_errors(&batch).unwrap();
    assert!(errors.values().all(|e| e.is_finite()));
}

#[test]
fn test_phase_transition_table() {
    let batch = batch();
    let mut model = build(&config(OutputHandlingKind::ShareTrunk), DecompositionKind::Qr).unwrap();

    // Same phase is a no-op.
    model.update_training_phase(TwoStepPhase::Trunk).unwrap();

    model.compute_trained_trunk(batch.trunk_input().unwrap()).unwrap();
    model.update_training_phase(TwoStepPhase::Branch).unwrap();

    let err = model.update_training_phase(TwoStepPhase::Trunk).unwrap_err();
    assert!(matches!(err, DeepOnetError::InvalidPhaseTransition { .. }));

    model.update_training_phase(TwoStepPhase::Both).unwrap();
    let err = model.update_training_phase(TwoStepPhase::Branch).unwrap_err();
    assert!(matches!(err, DeepOnetError::InvalidPhaseTransition { .. }));
    assert_eq!(model.phase(), Some(TwoStepPhase::Both));
}

#[test]
fn test_trunk_phase_trains_trunk_and_coefficients() {
    let model = build(&config(OutputHandlingKind::ShareTrunk), DecompositionKind::Qr).unwrap();

    // Trunk [1, 16, 4]: two weights and two biases, plus A.
    assert_eq!(model.trainable_vars().len(), 5);
    assert!(!model.parts().branch.is_trainable());
    assert!(model.parts().trunk.is_trainable());

    let two_step = model.strategy().as_two_step().unwrap();
    let a = two_step.helper().coefficients().unwrap();
    assert_eq!(a.as_tensor().dims(), &[N_SAMPLES, 8]);

    let batch = batch();
    let outputs = model.forward(batch.xb.as_ref(), batch.xt.as_ref()).unwrap();
    assert_eq!(outputs[0].dims(), &[N_SAMPLES, N_POINTS]);
    assert!(model.compute_loss(&batch).is_ok());
}

#[test]
fn test_decomposition_reproduces_trunk_output() {
    for kind in [DecompositionKind::Qr, DecompositionKind::Svd] {
        let batch = batch();
        let xt = batch.trunk_input().unwrap();
        let mut model = build(&config(OutputHandlingKind::SplitNetworks), kind).unwrap();
        let trunk_out = model.parts().trunk.forward(Some(xt)).unwrap();

        let q = model.compute_trained_trunk(xt).unwrap();
        assert_eq!(q.dims(), &[N_POINTS, 8]);

        let helper = model.strategy().as_two_step().unwrap().helper();
        let r = helper.basis_change().unwrap();
        assert_eq!(r.dims(), &[8, 8]);

        // T = Q·R blockwise.
        let rebuilt = q.matmul(r).unwrap();
        assert!(max_abs_diff(&rebuilt, &trunk_out) < 1e-4, "{kind:?}");

        // Each K-wide block of Q is orthonormal.
        for j in 0..2 {
            let block = q.narrow(1, j * 4, 4).unwrap().contiguous().unwrap();
            let gram = block.t().unwrap().matmul(&block).unwrap();
            let eye = linalg::identity(4, DType::F32, &Device::Cpu).unwrap();
            assert!(max_abs_diff(&gram, &eye) < 1e-4, "{kind:?} block {j}");
        }

        // Split R is merged into side-by-side K×K blocks.
        let merged = helper.merged_basis_change(2, 4).unwrap();
        assert_eq!(merged.dims(), &[4, 8]);
    }
}

#[test]
fn test_branch_phase_swaps_trunk_and_freezes_it() {
    let batch = batch();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut model = build(&config(OutputHandlingKind::ShareTrunk), DecompositionKind::Qr).unwrap();
    model.compute_trained_trunk(batch.trunk_input().unwrap()).unwrap();
    model.update_training_phase(TwoStepPhase::Branch).unwrap();
    model.prepare_for_phase(&mut rng).unwrap();

    assert_eq!(model.parts().trunk.kind_name(), "fixed");
    assert!(!model.parts().trunk.is_trainable());
    assert!(model.parts().branch.is_trainable());
    // Branch [3, 16, 8] only; A is no longer trained.
    assert_eq!(model.trainable_vars().len(), 4);

    // Branch outputs are compared to A·Rᵀ without touching the trunk.
    let outputs = model.forward(batch.xb.as_ref(), None).unwrap();
    assert_eq!(outputs[0].dims(), &[N_SAMPLES, 4]);
    let (loss, errors) = model.compute_loss_and_errors(&batch).unwrap();
    assert!(loss.to_scalar::<f32>().unwrap().is_finite());
    assert_eq!(errors.len(), 2);

    model.update_training_phase(TwoStepPhase::Both).unwrap();
    model.prepare_for_phase(&mut rng).unwrap();
    assert!(model.trainable_vars().is_empty());
    let outputs = model.forward(batch.xb.as_ref(), batch.xt.as_ref()).unwrap();
    assert_eq!(outputs[1].dims(), &[N_SAMPLES, N_POINTS]);
}

#[test]
fn test_share_branch_rejected_at_construction() {
    let mut config = config(OutputHandlingKind::ShareTrunk);
    config.output_handling = OutputHandlingKind::ShareBranch;
    let err = build(&config, DecompositionKind::Qr).unwrap_err();
    assert!(matches!(err, DeepOnetError::IncompatibleStrategies { .. }));
}

#[test]
fn test_same_seed_same_model() {
    let batch = batch();
    let config = config(OutputHandlingKind::SplitNetworks);
    let a = build(&config, DecompositionKind::Qr).unwrap();
    let b = build(&config, DecompositionKind::Qr).unwrap();
    let out_a = a.forward(batch.xb.as_ref(), batch.xt.as_ref()).unwrap();
    let out_b = b.forward(batch.xb.as_ref(), batch.xt.as_ref()).unwrap();
    assert_eq!(max_abs_diff(&out_a[0], &out_b[0]), 0.0);
}

#[test]
fn test_branch_targets_reproduce_trunk_phase_prediction() {
    let mut config = config(OutputHandlingKind::SplitNetworks);
    config.output_keys = vec!["u".into(), "v".into(), "w".into()];
    let batch = batch();
    let xt = batch.trunk_input().unwrap();
    let mut model = build(&config, DecompositionKind::Svd).unwrap();

    // Trunk-phase prediction A_i · T_iᵀ.
    let trunk_out = model.parts().trunk.forward(Some(xt)).unwrap();
    let a = model
        .strategy()
        .as_two_step()
        .unwrap()
        .helper()
        .coefficients()
        .unwrap()
        .as_tensor()
        .clone();
    assert_eq!(a.dims(), &[N_SAMPLES, 12]);
    let expected = model
        .parts()
        .output_handling
        .forward(&a, Some(&trunk_out))
        .unwrap();

    let q = model.compute_trained_trunk(xt).unwrap();
    let helper = model.strategy().as_two_step().unwrap().helper();
    assert_eq!(helper.merged_basis_change(3, 4).unwrap().dims(), &[4, 12]);
    let targets = helper
        .basis_change_targets(&model.parts().output_handling)
        .unwrap();
    assert_eq!(targets.len(), 3);

    for (i, (target, want)) in targets.iter().zip(&expected).enumerate() {
        assert_eq!(target.dims(), &[N_SAMPLES, 4]);
        let q_i = q.narrow(1, i * 4, 4).unwrap().contiguous().unwrap();
        let rebuilt = target.matmul(&q_i.t().unwrap()).unwrap();
        assert!(max_abs_diff(&rebuilt, want) < 1e-4, "output {i}");
    }
}

#[test]
fn test_coefficients_drawn_once_at_construction() {
    let config = config(OutputHandlingKind::ShareTrunk);
    let model = build(&config, DecompositionKind::Qr).unwrap();
    let a = model
        .strategy()
        .as_two_step()
        .unwrap()
        .helper()
        .coefficients()
        .unwrap()
        .as_tensor()
        .clone();

    // Same stream: branch [3, 16, 8], trunk [1, 16, 4], then A.
    let device = Device::Cpu;
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    Mlp::new(&[3, 16, 8], config.activation, DType::F32, &device, &mut rng).unwrap();
    Mlp::new(&[1, 16, 4], config.activation, DType::F32, &device, &mut rng).unwrap();
    let expected = kaiming_uniform(N_SAMPLES, 8, DType::F32, &device, &mut rng).unwrap();
    assert_eq!(max_abs_diff(&a, &expected), 0.0);
}

#[test]
fn test_trained_trunk_rejects_a_different_grid() {
    let batch = batch();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let mut model = build(&config(OutputHandlingKind::ShareTrunk), DecompositionKind::Qr).unwrap();
    model.compute_trained_trunk(batch.trunk_input().unwrap()).unwrap();
    model.update_training_phase(TwoStepPhase::Both).unwrap();
    model.prepare_for_phase(&mut rng).unwrap();

    let other_grid = Tensor::zeros((N_POINTS - 3, 1), DType::F32, &Device::Cpu).unwrap();
    let err = model
        .forward(batch.xb.as_ref(), Some(&other_grid))
        .unwrap_err();
    assert!(matches!(err, DeepOnetError::ShapeMismatch { .. }));

    let outputs = model.forward(batch.xb.as_ref(), batch.xt.as_ref()).unwrap();
    assert_eq!(outputs[0].dims(), &[N_SAMPLES, N_POINTS]);
}
