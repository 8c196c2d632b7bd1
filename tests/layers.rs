//! Tests that check layers against finite differences, hand-computed
//! results, and each other across devices.

use std::sync::Arc;

use ndarray::prelude::*;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use blobnet::gradient_check::GradientChecker;
use blobnet::layers::*;
use blobnet::*;

fn accelerator() -> Arc<Accelerator> {
    let config = AcceleratorConfig {
        label: "test".to_string(),
        num_threads: 3,
    };
    Arc::new(Accelerator::new(&config).unwrap())
}

fn context(mode: Mode, seed: u64) -> Context {
    match mode {
        Mode::Host => Context::host(),
        Mode::Accelerator => Context::with_accelerator(accelerator()),
    }
    .seeded(seed)
}

fn random_blob<T: Scalar>(shape: (usize, usize, usize, usize), seed: u64) -> Blob<T> {
    let mut rng = StdRng::seed_from_u64(seed);
    let x = Array::random_using(shape, Uniform::new(-1.0, 1.0), &mut rng).mapv(T::from_f64);
    Blob::from_array(x.view())
}

fn fc<T: Scalar>(
    num_output: usize,
    bias_term: bool,
    weight_filler: FillerConfig,
) -> InnerProductLayer<T> {
    InnerProductLayer::new(
        "fc",
        InnerProductConfig {
            num_output,
            bias_term,
            weight_filler,
            bias_filler: FillerConfig::Constant { value: 0.0 },
        },
    )
    .unwrap()
}

fn err(claimed: f64, measured: f64) -> f64 {
    let d = measured.abs().max(0.01);
    (claimed - measured).abs() / d
}

/// Column `i` of a weight blob: elements `i, i + width, i + 2*width, ...`.
fn column_norms(weight: &mut Param<f64>) -> Vec<f64> {
    let shape = weight.shape();
    let data = weight.host_data();
    (0..shape.width)
        .map(|i| {
            (0..shape.height)
                .map(|r| data[r * shape.width + i].powi(2))
                .sum::<f64>()
                .sqrt()
        })
        .collect()
}

#[test]
fn test_fc_gradients() {
    for mode in [Mode::Host, Mode::Accelerator] {
        for bias_term in [false, true] {
            for &(m, c, h, w, n) in &[(1, 1, 1, 1, 1), (2, 3, 1, 1, 4), (3, 2, 2, 2, 5)] {
                let mut ctx = context(mode, 7);
                let filler = FillerConfig::Gaussian {
                    mean: 0.0,
                    std: 1.0,
                };
                let mut layer = fc::<f64>(n, bias_term, filler);
                let mut bottom = vec![random_blob((m, c, h, w), 11)];
                let mut top = vec![];
                let report = GradientChecker::default()
                    .check(&mut ctx, &mut layer, &mut bottom, &mut top, &[0])
                    .unwrap();
                assert_eq!(
                    report.checked,
                    n * c * h * w + usize::from(bias_term) * n + m * c * h * w
                );
                assert!(
                    report.is_ok(),
                    "{mode:?}, bias {bias_term}, input ({m}, {c}, {h}, {w}), {n} outputs: {report}"
                );
            }
        }
    }
}

#[test]
fn test_fc_gradients_f32() {
    let mut ctx = context(Mode::Accelerator, 5);
    let mut layer = fc::<f32>(4, true, FillerConfig::Xavier);
    let mut bottom = vec![random_blob((3, 6, 1, 1), 2)];
    let mut top = vec![];
    let report = GradientChecker::default()
        .check(&mut ctx, &mut layer, &mut bottom, &mut top, &[0])
        .unwrap();
    assert!(report.is_ok(), "{report}");
}

#[test]
fn test_softmax_loss_gradients() {
    let mut ctx = Context::host();
    let mut layer = SoftmaxMultilabelLossLayer::<f64>::new("loss");
    let scores = random_blob((4, 3, 1, 2), 3);
    let mut labels = random_blob::<f64>((4, 3, 1, 2), 4);
    for l in labels.host_data_mut() {
        *l = l.abs();
    }
    let mut bottom = vec![scores, labels];
    let mut top = vec![];
    let checker = GradientChecker {
        stepsize: 1e-4,
        ..GradientChecker::default()
    };
    let report = checker
        .check(&mut ctx, &mut layer, &mut bottom, &mut top, &[0])
        .unwrap();
    assert!(report.is_ok(), "{report}");
}

/// Hand-rolled central differences on the loss, in the style of a per-element
/// consistency check, to make sure the checker itself isn't fooling us.
#[test]
fn test_softmax_loss_consistency() {
    let mut ctx = Context::host();
    let mut layer = SoftmaxMultilabelLossLayer::<f64>::new("loss");
    let mut bottom = vec![random_blob::<f64>((2, 5, 1, 1), 8), random_blob((2, 5, 1, 1), 9)];
    for l in bottom[1].host_data_mut() {
        *l = l.abs();
    }
    let mut top = vec![];
    layer.set_up_top(&mut ctx, &bottom, &mut top).unwrap();
    layer.forward(&ctx, &mut bottom, &mut top).unwrap();
    layer.backward(&ctx, &mut top, true, &mut bottom).unwrap();
    let dx = bottom[0].host_diff().to_vec();

    let h = 1e-5;
    for i in 0..dx.len() {
        let saved = bottom[0].host_data()[i];
        bottom[0].host_data_mut()[i] = saved + h;
        let plus = layer.forward(&ctx, &mut bottom, &mut top).unwrap();
        bottom[0].host_data_mut()[i] = saved - h;
        let minus = layer.forward(&ctx, &mut bottom, &mut top).unwrap();
        bottom[0].host_data_mut()[i] = saved;

        let claimed = dx[i];
        let measured = (plus - minus) / (2.0 * h);
        let error = err(claimed, measured);
        assert!(
            error <= 1e-4,
            "score {i} computed derivative = {claimed}, measured = {measured}, error = {error}"
        );
    }
}

/// Batch of 10, 5 inputs, 5 outputs, big random weights.
fn fc_10x5x5(bias_term: bool) -> (Context, InnerProductLayer<f64>, Vec<Blob<f64>>, Vec<Blob<f64>>) {
    let mut ctx = Context::host().seeded(1701);
    let mut layer = fc(5, bias_term, FillerConfig::Gaussian { mean: 0.0, std: 10.0 });
    let bottom = vec![random_blob((10, 5, 1, 1), 42)];
    let mut top = vec![];
    layer.set_up_top(&mut ctx, &bottom, &mut top).unwrap();
    (ctx, layer, bottom, top)
}

#[test]
fn test_fc_backward_without_bias() {
    let (ctx, mut layer, mut bottom, mut top) = fc_10x5x5(false);
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].shape(), Shape::new(10, 5, 1, 1));

    layer.forward(&ctx, &mut bottom, &mut top).unwrap();
    top[0].fill_diff(1.0);
    layer.backward(&ctx, &mut top, true, &mut bottom).unwrap();

    let x = bottom[0].data_array().into_shape((10, 5)).unwrap();
    let expected = Array2::<f64>::ones((5, 10)).dot(&x);
    let dw = layer.params_mut()[0].diff_array().into_shape((5, 5)).unwrap();
    for (&a, &b) in dw.iter().zip(&expected) {
        assert!((a - b).abs() < 1e-9, "weight diff {dw} != {expected}");
    }

    // dx = dy·W, with every dy = 1: each row is the column sums of W.
    let w = layer.params_mut()[0].data_array().into_shape((5, 5)).unwrap();
    let col_sums = w.sum_axis(Axis(0));
    let dx = bottom[0].diff_array().into_shape((10, 5)).unwrap();
    for row in dx.rows() {
        for (&a, &b) in row.iter().zip(&col_sums) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}

#[test]
fn test_fc_zero_bias_matches_no_bias() {
    let (ctx, mut plain, mut bottom, mut plain_top) = fc_10x5x5(false);
    let (bias_ctx, mut biased, mut bias_bottom, mut biased_top) = fc_10x5x5(true);

    // Same seed, same weights.
    assert_eq!(
        plain.params_mut()[0].host_data(),
        biased.params_mut()[0].host_data()
    );

    plain.forward(&ctx, &mut bottom, &mut plain_top).unwrap();
    biased.forward(&bias_ctx, &mut bias_bottom, &mut biased_top).unwrap();
    assert_eq!(plain_top[0].host_data(), biased_top[0].host_data());

    biased_top[0].fill_diff(1.0);
    biased
        .backward(&bias_ctx, &mut biased_top, true, &mut bias_bottom)
        .unwrap();
    assert_eq!(biased.params_mut()[1].host_diff(), &[10.0; 5]);
}

#[test]
fn test_backward_overwrites_diffs() {
    let (ctx, mut layer, mut bottom, mut top) = fc_10x5x5(true);
    layer.forward(&ctx, &mut bottom, &mut top).unwrap();

    top[0].fill_diff(3.0);
    layer.backward(&ctx, &mut top, true, &mut bottom).unwrap();
    top[0].fill_diff(1.0);
    layer.backward(&ctx, &mut top, true, &mut bottom).unwrap();
    let twice = layer.params_mut()[0].host_diff().to_vec();
    let twice_bias = layer.params_mut()[1].host_diff().to_vec();

    let (ctx, mut fresh, mut bottom, mut top) = fc_10x5x5(true);
    fresh.forward(&ctx, &mut bottom, &mut top).unwrap();
    top[0].fill_diff(1.0);
    fresh.backward(&ctx, &mut top, true, &mut bottom).unwrap();
    assert_eq!(fresh.params_mut()[0].host_diff(), &twice[..]);
    assert_eq!(fresh.params_mut()[1].host_diff(), &twice_bias[..]);
}

#[test]
fn test_set_up_twice_keeps_params() {
    let (mut ctx, mut layer, bottom, mut top) = fc_10x5x5(true);
    let weight = layer.params_mut()[0].host_data().to_vec();
    let bias = layer.params_mut()[1].host_data().to_vec();
    layer.set_up_top(&mut ctx, &bottom, &mut top).unwrap();
    assert_eq!(layer.params_mut()[0].host_data(), &weight[..]);
    assert_eq!(layer.params_mut()[1].host_data(), &bias[..]);
    assert_eq!(top[0].shape(), Shape::new(10, 5, 1, 1));
}

/// Weights with 3 outputs and 2 inputs. Column 0 is (3, 4, 0), norm 5;
/// column 1 is (0, 0.1, 0.1), norm about 0.141.
fn layer_with_known_columns(mode: Mode) -> (Context, InnerProductLayer<f64>) {
    let mut ctx = context(mode, 0);
    let mut layer = fc(3, false, FillerConfig::default());
    layer.set_up(&mut ctx, &[Blob::new((1, 2, 1, 1))]).unwrap();
    layer.params_mut()[0]
        .host_data_mut()
        .copy_from_slice(&[3.0, 0.0, 4.0, 0.1, 0.0, 0.1]);
    (ctx, layer)
}

#[test]
fn test_normalize_weights_clips_to_max() {
    for mode in [Mode::Host, Mode::Accelerator] {
        let (ctx, mut layer) = layer_with_known_columns(mode);
        layer.normalize_weights(&ctx, 1.0).unwrap();
        let weight = &mut layer.params_mut()[0];
        let norms = column_norms(weight);
        assert!((norms[0] - 1.0).abs() < 1e-6, "{mode:?}: {norms:?}");
        let data = weight.host_data();
        assert!((data[0] - 0.6).abs() < 1e-6 && (data[2] - 0.8).abs() < 1e-6);
        // Under the limit: untouched, bit for bit.
        assert_eq!([data[1], data[3], data[5]], [0.0, 0.1, 0.1]);
    }
}

#[test]
fn test_normalize_weights_range() {
    for mode in [Mode::Host, Mode::Accelerator] {
        let (ctx, mut layer) = layer_with_known_columns(mode);
        layer.normalize_weights_range(&ctx, 0.5, 2.0, 1.0).unwrap();
        let norms = column_norms(&mut layer.params_mut()[0]);
        assert!((norms[0] - 1.0).abs() < 1e-6, "{mode:?}: {norms:?}");
        assert!((norms[1] - 1.0).abs() < 1e-5, "{mode:?}: {norms:?}");

        // Both columns are now inside the range, so a second pass is a no-op.
        let before = layer.params_mut()[0].host_data().to_vec();
        layer.normalize_weights_range(&ctx, 0.5, 2.0, 1.0).unwrap();
        assert_eq!(layer.params_mut()[0].host_data(), &before[..]);
    }
}

#[test]
fn test_host_and_accelerator_agree() {
    let mut results = vec![];
    for mode in [Mode::Host, Mode::Accelerator] {
        let mut ctx = context(mode, 99);
        let mut layer = fc::<f32>(7, true, FillerConfig::Uniform { min: -1.0, max: 1.0 });
        let mut bottom = vec![random_blob((6, 4, 2, 1), 100)];
        let mut top = vec![];
        layer.set_up_top(&mut ctx, &bottom, &mut top).unwrap();
        layer.forward(&ctx, &mut bottom, &mut top).unwrap();
        let dy = random_blob::<f32>((6, 7, 1, 1), 101).host_data().to_vec();
        top[0].host_diff_mut().copy_from_slice(&dy);
        layer.backward(&ctx, &mut top, true, &mut bottom).unwrap();
        results.push((
            top[0].host_data().to_vec(),
            bottom[0].host_diff().to_vec(),
            layer.params_mut()[0].host_diff().to_vec(),
            layer.params_mut()[1].host_diff().to_vec(),
        ));
    }
    let (host, acc) = (&results[0], &results[1]);
    let pairs = [(&host.0, &acc.0), (&host.1, &acc.1), (&host.2, &acc.2), (&host.3, &acc.3)];
    for (h, a) in pairs {
        assert_eq!(h.len(), a.len());
        for (&h, &a) in h.iter().zip(a) {
            let scale = h.abs().max(a.abs()).max(1.0);
            assert!((h - a).abs() / scale < 1e-4, "host {h} vs accelerator {a}");
        }
    }
}

#[test]
fn test_device_memory_is_released() {
    let acc = accelerator();
    {
        let mut ctx = Context::with_accelerator(acc.clone()).seeded(1);
        let mut layer = fc::<f32>(3, true, FillerConfig::Xavier);
        let mut bottom = vec![random_blob((2, 4, 1, 1), 1)];
        let mut top = vec![];
        layer.set_up_top(&mut ctx, &bottom, &mut top).unwrap();
        layer.forward(&ctx, &mut bottom, &mut top).unwrap();
        assert!(acc.live_buffers() > 0);
        assert!(acc.allocated_bytes() > 0);
    }
    assert_eq!(acc.live_buffers(), 0);
    assert_eq!(acc.allocated_bytes(), 0);
}

#[test]
fn test_mode_errors() {
    // Accelerator mode with no accelerator.
    let mut ctx = Context::host();
    let mut layer = fc::<f64>(2, true, FillerConfig::default());
    let mut bottom = vec![Blob::new((1, 3, 1, 1))];
    let mut top = vec![];
    layer.set_up_top(&mut ctx, &bottom, &mut top).unwrap();
    ctx.set_mode(Mode::Accelerator);
    assert!(matches!(
        layer.forward(&ctx, &mut bottom, &mut top),
        Err(Error::DeviceUnavailable)
    ));
    assert!(matches!(
        layer.normalize_weights(&ctx, 1.0),
        Err(Error::DeviceUnavailable)
    ));

    // The loss layer has no accelerator kernels.
    let mut ctx = context(Mode::Accelerator, 0);
    let mut loss = SoftmaxMultilabelLossLayer::<f64>::new("loss");
    let mut bottom = vec![Blob::new((1, 3, 1, 1)), Blob::new((1, 3, 1, 1))];
    loss.set_up_top(&mut ctx, &bottom, &mut top).unwrap();
    assert!(top.is_empty());
    assert!(matches!(
        loss.forward(&ctx, &mut bottom, &mut top),
        Err(Error::UnsupportedMode { mode: Mode::Accelerator, .. })
    ));
}
