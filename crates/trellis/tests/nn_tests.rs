// Integration tests for trellis-nn
//
// These tests run whole modules and module chains, and check every module's
// hand-written derivatives against finite differences with ModuleTester.

use rand::rngs::StdRng;
use rand::SeedableRng;
use trellis::prelude::*;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn check_input<M: Module<f64> + ?Sized>(
    module: &mut M,
    input: impl Into<Shape>,
    seed: u64,
) -> trellis::Result<()> {
    let mut input = State::new(input)?;
    let mut output = State::new(1)?;
    let report = ModuleTester::new(seed).test_jacobian(module, &mut input, &mut output)?;
    assert!(report.passed(), "{}: {}", module.describe(), report);
    Ok(())
}

fn check_param<M: Module<f64> + ?Sized>(
    module: &mut M,
    input: impl Into<Shape>,
    seed: u64,
) -> trellis::Result<()> {
    let mut input = State::new(input)?;
    let mut output = State::new(1)?;
    let report = ModuleTester::new(seed).test_jacobian_param(module, &mut input, &mut output)?;
    assert!(report.passed(), "{}: {}", module.describe(), report);
    Ok(())
}

fn check_curvature<M: Module<f64> + ?Sized>(
    module: &mut M,
    input: impl Into<Shape>,
    seed: u64,
) -> trellis::Result<()> {
    let mut input = State::new(input)?;
    let mut output = State::new(1)?;
    let report = ModuleTester::new(seed).test_bbprop(module, &mut input, &mut output)?;
    assert!(report.passed(), "{}: {}", module.describe(), report);
    Ok(())
}

fn check_curvature_param<M: Module<f64> + ?Sized>(
    module: &mut M,
    input: impl Into<Shape>,
    seed: u64,
) -> trellis::Result<()> {
    let mut input = State::new(input)?;
    let mut output = State::new(1)?;
    let report = ModuleTester::new(seed).test_bbprop_param(module, &mut input, &mut output)?;
    assert!(report.passed(), "{}: {}", module.describe(), report);
    Ok(())
}

// Concrete scenarios

#[test]
fn test_convolution_bias_tanh_scenario() -> trellis::Result<()> {
    let mut conv = ConvolutionModule::<f64>::new("c", (2, 2), (1, 1), ConnectionTable::full(1, 1), None)?;
    conv.load_x(&[Tensor::from_vec(vec![0.05, 0.10, 0.15, 0.20], (1, 2, 2))?])?;
    let mut bias = BiasModule::new("b", 1, None)?;
    bias.load_x(&[Tensor::from_vec(vec![-2.85], 1)?])?;
    let mut squash = TanhModule::new("t");

    let input = State::from_tensor(Tensor::from_vec(
        (1..=9).map(|v| v as f64).collect(),
        (1, 3, 3),
    )?);
    let mut sum = State::new(1)?;
    let mut biased = State::new(1)?;
    let mut output = State::new(1)?;
    conv.fprop(&input, &mut sum)?;
    bias.fprop(&sum, &mut biased)?;
    squash.fprop(&biased, &mut output)?;

    assert_eq!(output.dims(), &[1, 2, 2]);
    assert_vec_approx(
        &output.x().to_vec()?,
        &[-0.761594, -0.462117, 0.462117, 0.761594],
        1e-6,
    );
    Ok(())
}

#[test]
fn test_convolution_layer_matches_scenario() -> trellis::Result<()> {
    let mut layer = ConvolutionLayer::<f64>::new("c0", (2, 2), (1, 1), ConnectionTable::full(1, 1), None)?;
    layer.load_x(&[
        Tensor::from_vec(vec![0.05, 0.10, 0.15, 0.20], (1, 2, 2))?,
        Tensor::from_vec(vec![-2.85], 1)?,
    ])?;
    let input = State::from_tensor(Tensor::from_vec(
        (1..=9).map(|v| v as f64).collect(),
        (1, 3, 3),
    )?);
    let mut output = State::new(1)?;
    layer.fprop(&input, &mut output)?;
    assert_vec_approx(
        &layer.sum().x().to_vec()?,
        &[-1.0, -0.5, 0.5, 1.0],
        1e-12,
    );
    assert_vec_approx(
        &output.x().to_vec()?,
        &[-0.761594, -0.462117, 0.462117, 0.761594],
        1e-6,
    );
    Ok(())
}

#[test]
fn test_zpad_from_kernel_scenario() -> trellis::Result<()> {
    let mut pad = ZpadModule::from_kernel("z", (7, 7))?;
    let data: Vec<f64> = (0..500).map(|v| v as f64 + 1.0).collect();
    let input = State::from_tensor(Tensor::from_vec(data, (5, 10, 10))?);
    let mut output = State::new(1)?;
    pad.fprop(&input, &mut output)?;
    assert_eq!(output.dims(), &[5, 16, 16]);

    let center = output.x().narrow(1, 10, 3)?.narrow(2, 10, 3)?;
    assert_eq!(center.to_vec()?, input.x().to_vec()?);

    let out = output.x();
    for f in 0..5 {
        for i in 0..16 {
            for j in 0..16 {
                let inside = (3..13).contains(&i) && (3..13).contains(&j);
                if !inside {
                    assert_eq!(out.get(&[f, i, j])?, 0.0, "border at {} {} {}", f, i, j);
                }
            }
        }
    }
    Ok(())
}

#[test]
fn test_full_table_completeness() -> trellis::Result<()> {
    let table = ConnectionTable::full(3, 4);
    assert_eq!(table.len(), 12);
    for o in 0..4 {
        assert_eq!(table.fan_in(o), 3);
    }
    for i in 0..3 {
        assert_eq!(table.fan_out(i), 4);
    }
    let conv = ConvolutionModule::<f32>::new("c", (3, 3), (1, 1), table, None)?;
    assert!(conv.is_full_table());
    assert_eq!(conv.thickness(), 4);
    assert_eq!(conv.kernel().dims(), &[12, 3, 3]);
    Ok(())
}

#[test]
fn test_disconnected_table_is_fatal() {
    let empty = ConnectionTable::from_pairs(vec![]);
    assert!(ConvolutionModule::<f32>::new("c", (3, 3), (1, 1), empty, None).is_err());
}

#[test]
fn test_shared_parameter_buffer() -> trellis::Result<()> {
    let mut param = Parameter::<f64>::new();
    let conv = ConvolutionLayer::new("c0", (5, 5), (1, 1), ConnectionTable::full(1, 6), Some(&mut param))?;
    let sub = SubsamplingModule::new("s1", 6, (2, 2), Some(&mut param))?;
    let full = FullLayer::new("f2", 6, 10, Some(&mut param))?;
    let expected = conv.num_parameters() + sub.num_parameters() + full.num_parameters();
    assert_eq!(param.len(), expected);

    // the subsampling coefficients were initialised through the shared buffer
    let offset = conv.num_parameters();
    let flat = param.x()?.to_vec()?;
    assert_vec_approx(&flat[offset..offset + 6], &[0.5; 6], 1e-12);
    Ok(())
}

// Jacobian checks, input side

#[test]
fn test_jacobian_linear() -> trellis::Result<()> {
    check_input(&mut LinearModule::new("l", 4, 3, None)?, (4, 2), 1)
}

#[test]
fn test_jacobian_convolution() -> trellis::Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let table = ConnectionTable::random(3, 4, 2, &mut rng)?;
    check_input(&mut ConvolutionModule::new("c", (3, 3), (1, 1), table, None)?, (3, 5, 5), 2)
}

#[test]
fn test_jacobian_convolution_strided_with_crop() -> trellis::Result<()> {
    let mut conv = ConvolutionModule::new("c", (3, 2), (2, 2), ConnectionTable::full(2, 2), None)?;
    // (6 - 3) is not a multiple of 2: the last row is cropped away
    check_input(&mut conv, (2, 6, 5), 3)
}

#[test]
fn test_jacobian_bias() -> trellis::Result<()> {
    check_input(&mut BiasModule::new("b", 3, None)?, (3, 2, 2), 4)
}

#[test]
fn test_jacobian_tanh() -> trellis::Result<()> {
    check_input(&mut TanhModule::new("t"), (2, 3, 3), 5)
}

#[test]
fn test_jacobian_power() -> trellis::Result<()> {
    let mut input = State::new((2, 4))?;
    let mut output = State::new(1)?;
    let report = ModuleTester::new(6)
        .with_input_range(0.5, 2.0)
        .test_jacobian(&mut PowerModule::new("p", 2.5), &mut input, &mut output)?;
    assert!(report.passed(), "{}", report);
    Ok(())
}

#[test]
fn test_jacobian_thres() -> trellis::Result<()> {
    check_input(&mut ThresModule::new("th", 0.0, -1.0), (3, 4), 7)
}

#[test]
fn test_jacobian_zpad() -> trellis::Result<()> {
    check_input(&mut ZpadModule::new("z", 1, 2, 0, 1), (2, 3, 3), 8)
}

#[test]
fn test_jacobian_mirrorpad() -> trellis::Result<()> {
    check_input(&mut MirrorpadModule::new("m", 2, 1), (2, 4, 3), 9)
}

#[test]
fn test_jacobian_cutborder() -> trellis::Result<()> {
    check_input(&mut CutborderModule::new("cb", 1, 2), (2, 5, 6), 10)
}

#[test]
fn test_jacobian_fsum() -> trellis::Result<()> {
    check_input(&mut FsumModule::new("fs", true, 0.5), (5, 2, 2), 11)?;
    check_input(&mut FsumModule::new("fs", false, 1.0), (3, 2, 2), 12)
}

#[test]
fn test_jacobian_subsampling() -> trellis::Result<()> {
    check_input(&mut SubsamplingModule::new("s", 2, (2, 3), None)?, (2, 5, 6), 13)
}

#[test]
fn test_jacobian_full_layer() -> trellis::Result<()> {
    check_input(&mut FullLayer::new("f", 5, 3, None)?, 5, 14)
}

#[test]
fn test_jacobian_convolution_layer() -> trellis::Result<()> {
    let mut layer = ConvolutionLayer::new("c", (3, 3), (1, 1), ConnectionTable::full(2, 3), None)?;
    check_input(&mut layer, (2, 5, 4), 15)
}

#[test]
fn test_jacobian_stdsigmoid() -> trellis::Result<()> {
    check_input(&mut StdsigmoidModule::new("s"), (2, 3, 3), 17)?;
    check_input(&mut StdsigmoidModule::with_linear("s", 0.1), (4, 2), 18)
}

#[test]
fn test_jacobian_abs() -> trellis::Result<()> {
    check_input(&mut AbsModule::new("a", 0.0), (3, 4), 19)
}

#[test]
fn test_jacobian_softmax() -> trellis::Result<()> {
    check_input(&mut SoftmaxModule::new("sm"), 6, 20)?;
    check_input(&mut SoftmaxModule::with_beta("sm", 0.5), (2, 3), 26)
}

#[test]
fn test_jacobian_lppooling() -> trellis::Result<()> {
    check_input(&mut LppoolingModule::new("lp", 2, (3, 3), (2, 2), 2)?, (2, 7, 7), 27)?;
    check_input(&mut LppoolingModule::new("lp", 1, (2, 2), (1, 1), 3)?, (1, 4, 4), 28)?;
    check_input(&mut LppoolingModule::new("lp", 2, (2, 3), (2, 1), 1)?, (2, 4, 5), 29)
}

#[test]
fn test_jacobian_subtractive_norm() -> trellis::Result<()> {
    let zero = NormConfig::new((3, 3), 2)?;
    check_input(&mut SubtractiveNormModule::new("sn", zero)?, (2, 4, 4), 30)?;
    let mirror = NormConfig::new((3, 3), 3)?.mirror(true).fsum(true, 0.5);
    check_input(&mut SubtractiveNormModule::new("sn", mirror)?, (3, 4, 5), 31)
}

#[test]
fn test_jacobian_divisive_norm() -> trellis::Result<()> {
    // inputs in [2, 4] keep every local std above the unit threshold
    let configs = [
        NormConfig::new((3, 3), 2)?.mirror(true),
        NormConfig::new((3, 3), 2)?.across_features(false),
    ];
    for (seed, config) in configs.into_iter().enumerate() {
        let mut module = DivisiveNormModule::<f64>::new("dn", config, false)?;
        let mut input = State::new((2, 4, 4))?;
        let mut output = State::new(1)?;
        let report = ModuleTester::new(32 + seed as u64)
            .with_input_range(2.0, 4.0)
            .test_jacobian(&mut module, &mut input, &mut output)?;
        assert!(report.passed(), "{}: {}", module.describe(), report);
    }
    Ok(())
}

fn small_net() -> trellis::Result<Layers<f64>> {
    Ok(Layers::new("net")
        .add(ConvolutionLayer::new("c0", (3, 3), (1, 1), ConnectionTable::full(1, 2), None)?)
        .add(SubsamplingModule::new("s1", 2, (2, 2), None)?)
        .add(FullLayer::new("f2", 2, 3, None)?))
}

#[test]
fn test_jacobian_layers() -> trellis::Result<()> {
    check_input(&mut small_net()?, (1, 6, 6), 16)
}

// Jacobian checks, parameter side

#[test]
fn test_jacobian_param_linear() -> trellis::Result<()> {
    check_param(&mut LinearModule::new("l", 3, 4, None)?, (3, 2), 21)
}

#[test]
fn test_jacobian_param_convolution() -> trellis::Result<()> {
    let table = ConnectionTable::from_pairs(vec![(0, 0), (1, 0), (1, 1)]);
    check_param(&mut ConvolutionModule::new("c", (2, 3), (1, 2), table, None)?, (2, 4, 7), 22)
}

#[test]
fn test_jacobian_param_bias() -> trellis::Result<()> {
    check_param(&mut BiasModule::new("b", 2, None)?, (2, 3), 23)
}

#[test]
fn test_jacobian_param_subsampling() -> trellis::Result<()> {
    check_param(&mut SubsamplingModule::new("s", 3, (2, 2), None)?, (3, 4, 4), 24)
}

#[test]
fn test_jacobian_param_layers() -> trellis::Result<()> {
    check_param(&mut small_net()?, (1, 6, 6), 25)
}

// bbprop against the squared bprop Jacobian

#[test]
fn test_curvature_pointwise() -> trellis::Result<()> {
    check_curvature(&mut TanhModule::new("t"), (2, 3), 40)?;
    check_curvature(&mut StdsigmoidModule::with_linear("s", 0.2), (2, 3), 41)?;
    check_curvature(&mut AbsModule::new("a", 0.0), (2, 3), 42)?;
    check_curvature(&mut ThresModule::new("th", 0.0, -1.0), (2, 3), 43)?;
    let mut input = State::new((2, 3))?;
    let mut output = State::new(1)?;
    let report = ModuleTester::new(44)
        .with_input_range(0.5, 2.0)
        .test_bbprop(&mut PowerModule::new("p", 2.5), &mut input, &mut output)?;
    assert!(report.passed(), "{}", report);
    Ok(())
}

#[test]
fn test_curvature_softmax() -> trellis::Result<()> {
    check_curvature(&mut SoftmaxModule::new("sm"), 5, 45)?;
    check_curvature(&mut SoftmaxModule::with_beta("sm", 2.0), (2, 2), 46)
}

#[test]
fn test_curvature_linear() -> trellis::Result<()> {
    check_curvature(&mut LinearModule::new("l", 3, 4, None)?, (3, 2), 47)?;
    check_curvature_param(&mut LinearModule::new("l", 3, 4, None)?, (3, 2), 48)
}

#[test]
fn test_curvature_convolution() -> trellis::Result<()> {
    let table = ConnectionTable::from_pairs(vec![(0, 0), (1, 0), (1, 1)]);
    check_curvature(&mut ConvolutionModule::new("c", (2, 3), (1, 2), table.clone(), None)?, (2, 4, 7), 49)?;
    check_curvature_param(&mut ConvolutionModule::new("c", (2, 3), (1, 2), table, None)?, (2, 4, 7), 50)
}

#[test]
fn test_curvature_bias_and_subsampling() -> trellis::Result<()> {
    check_curvature(&mut BiasModule::new("b", 2, None)?, (2, 3), 51)?;
    check_curvature_param(&mut BiasModule::new("b", 2, None)?, (2, 3), 52)?;
    check_curvature(&mut SubsamplingModule::new("s", 2, (2, 3), None)?, (2, 5, 6), 53)?;
    check_curvature_param(&mut SubsamplingModule::new("s", 2, (2, 3), None)?, (2, 5, 6), 54)
}

#[test]
fn test_curvature_feature_sum_and_borders() -> trellis::Result<()> {
    check_curvature(&mut FsumModule::new("fs", true, 0.5), (5, 2, 2), 55)?;
    check_curvature(&mut ZpadModule::new("z", 1, 2, 0, 1), (2, 3, 3), 56)?;
    check_curvature(&mut MirrorpadModule::new("m", 2, 1), (2, 4, 3), 57)?;
    check_curvature(&mut CutborderModule::new("cb", 1, 2), (2, 5, 6), 58)
}

// Shapes and descriptions

#[test]
fn test_layers_size_inference() -> trellis::Result<()> {
    let net = small_net()?;
    assert_eq!(net.fprop_size(&Shape::from((1, 6, 6)))?, Shape::from((3, 2, 2)));
    assert_eq!(net.bprop_size(&Shape::from((3, 2, 2)))?, Shape::from((1, 6, 6)));
    let text = net.describe();
    assert!(text.starts_with("layers net:"));
    assert!(text.contains("subsampling module s1 with thickness 2 and stride 2x2"));
    Ok(())
}

#[test]
fn test_bbprop_runs_through_chain() -> trellis::Result<()> {
    let mut net = small_net()?;
    net.forget(&mut ForgetParam::with_seed(1.0, 0.5, 3))?;
    let mut input = State::from_tensor(Tensor::full((1, 6, 6), 0.5f64)?);
    let mut output = State::new(1)?;
    net.fprop(&input, &mut output)?;
    output.prepare_ddx()?;
    ops::fill(output.ddx()?, 1.0)?;
    input.prepare_ddx()?;
    for p in net.parameters() {
        p.zero_ddx()?;
    }
    net.bbprop(&mut input, &output)?;
    // Gauss-Newton curvature is a sum of squares: never negative
    assert!(ops::min(input.ddx()?)? >= 0.0);
    for p in net.parameters() {
        assert!(ops::min(p.ddx()?)? >= 0.0);
    }
    Ok(())
}

#[test]
fn test_diff_and_mul() -> trellis::Result<()> {
    let mut a = State::from_tensor(Tensor::from_vec(vec![1.0f64, 2.0, 3.0], 3)?);
    let mut b = State::from_tensor(Tensor::from_vec(vec![4.0f64, 5.0, 6.0], 3)?);
    let mut out = State::new(1)?;

    DiffModule::new("d").fprop(&a, &b, &mut out)?;
    assert_eq!(out.x().to_vec()?, vec![-3.0, -3.0, -3.0]);

    let mut mul = MulModule::new("m");
    Module2::<f64>::fprop(&mut mul, &a, &b, &mut out)?;
    assert_eq!(out.x().to_vec()?, vec![4.0, 10.0, 18.0]);
    out.prepare_dx()?;
    ops::fill(out.dx()?, 1.0)?;
    a.prepare_dx()?;
    b.prepare_dx()?;
    mul.bprop(&mut a, &mut b, &out)?;
    assert_eq!(a.dx()?.to_vec()?, vec![4.0, 5.0, 6.0]);
    assert_eq!(b.dx()?.to_vec()?, vec![1.0, 2.0, 3.0]);
    Ok(())
}
