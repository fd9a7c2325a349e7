//! PathTrace orchestration across devices
//!
//! Validates:
//! - CPU and wavefront devices produce the same image
//! - Multi-device slicing and rebalancing keep every pixel's samples
//! - Cancellation, device failure, callbacks, display, denoise and adaptive stop

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use forge3d_integrator::path_tracing::denoiser::BoxFilterDenoiser;
use forge3d_integrator::path_tracing::display::HalfDisplay;
use forge3d_integrator::path_tracing::film::{FilmPasses, KernelFilm};
use forge3d_integrator::path_tracing::kernel::{reference, KernelData, KernelFunctions, KernelGlobals};
use forge3d_integrator::path_tracing::state::{IntegratorState, PathQueue};
use forge3d_integrator::path_tracing::{BufferParams, PathTrace, PathTraceState, RenderBuffers, RenderWork};
use forge3d_integrator::{Device, DeviceInfo, DeviceType, IntegratorConfig, RenderError};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config() -> IntegratorConfig {
    IntegratorConfig {
        max_num_paths: 256,
        threads_per_block: 32,
        cpu_threads: 2,
        max_bounce: 4,
        seed: 11,
        ..Default::default()
    }
}

fn make_path_trace(
    device_types: &[DeviceType],
    config: &IntegratorConfig,
    film: KernelFilm,
    kernels: KernelFunctions,
) -> PathTrace {
    init_logging();
    let devices = device_types
        .iter()
        .enumerate()
        .map(|(i, device_type)| match device_type {
            DeviceType::Cpu => Device::new(DeviceInfo::cpu(format!("cpu{i}"), config)),
            DeviceType::Wavefront => Device::new(DeviceInfo::wavefront(format!("wf{i}"), config)),
        })
        .collect();
    let data = Arc::new(KernelData::new(film, config));
    PathTrace::new(devices, kernels, data, config).unwrap()
}

fn render_image(device_types: &[DeviceType], width: usize, height: usize, steps: &[(usize, usize)]) -> RenderBuffers {
    let config = test_config();
    let film = KernelFilm::default();
    let mut pt = make_path_trace(device_types, &config, film, reference::kernel_functions());
    let params = BufferParams::new(width, height, film.pass_stride);
    pt.reset(params);
    for &(start, num) in steps {
        pt.render(&RenderWork::samples(start, num)).unwrap();
        assert_eq!(pt.state(), PathTraceState::Finished);
    }
    assert_eq!(pt.get_num_active_paths(), 0);
    let buffers = RenderBuffers::new(params);
    pt.copy_to_render_buffers(&buffers);
    buffers
}

fn assert_images_match(a: &RenderBuffers, b: &RenderBuffers) {
    let film = KernelFilm::default();
    let combined = film.pass_combined.unwrap();
    let sample_count = film.pass_sample_count.unwrap();
    for pixel in 0..a.params().num_pixels() {
        let base = pixel * film.pass_stride;
        assert_eq!(a.read_u32(base + sample_count), b.read_u32(base + sample_count), "pixel {pixel}");
        for c in 0..4 {
            let (va, vb) = (a.read(base + combined + c), b.read(base + combined + c));
            assert!(
                (va - vb).abs() <= 1e-4 * va.abs().max(1.0),
                "pixel {pixel} channel {c}: {va} vs {vb}"
            );
        }
    }
}

fn mean_radiance(buffers: &RenderBuffers) -> f32 {
    let film = KernelFilm::default();
    let n = buffers.params().num_pixels();
    let sum: f32 = (0..n)
        .map(|pixel| {
            let base = pixel * film.pass_stride;
            buffers.read(base + film.pass_combined.unwrap())
                / buffers.read_u32(base + film.pass_sample_count.unwrap()) as f32
        })
        .sum();
    sum / n as f32
}

#[test]
fn test_cpu_and_wavefront_agree() {
    let steps = [(0, 8), (8, 8)];
    let cpu = render_image(&[DeviceType::Cpu], 16, 8, &steps);
    let wavefront = render_image(&[DeviceType::Wavefront], 16, 8, &steps);
    assert_images_match(&cpu, &wavefront);

    let film = KernelFilm::default();
    assert_eq!(cpu.read_u32(film.pass_sample_count.unwrap()), 16);
    let expected = reference::expected_radiance(test_config().max_bounce);
    let mean = mean_radiance(&cpu);
    assert!((mean - expected).abs() < 0.06, "mean {mean} expected {expected}");
}

#[test]
fn test_multi_device_matches_single_device() {
    let steps = [(0, 4), (4, 4), (8, 4), (12, 4)];
    let single = render_image(&[DeviceType::Cpu], 16, 16, &steps);
    let multi = render_image(&[DeviceType::Cpu, DeviceType::Wavefront], 16, 16, &steps);
    assert_images_match(&single, &multi);
}

#[test]
fn test_slices_cover_frame_after_rebalance() {
    let config = test_config();
    let film = KernelFilm::default();
    let mut pt = make_path_trace(
        &[DeviceType::Wavefront, DeviceType::Cpu, DeviceType::Cpu],
        &config,
        film,
        reference::kernel_functions(),
    );
    pt.reset(BufferParams::new(8, 24, film.pass_stride));

    for step in 0..6 {
        pt.render(&RenderWork::samples(step * 2, 2)).unwrap();
        let mut next_y = 0;
        for work in pt.works() {
            let slice = work.effective_buffer_params();
            assert_eq!(slice.full_y, next_y);
            assert_eq!(slice.width, 8);
            next_y += slice.height;
        }
        assert_eq!(next_y, 24);
        let total_weight: f64 = pt.work_balance_infos().iter().map(|info| info.weight).sum();
        assert!((total_weight - 1.0).abs() < 1e-9);
    }

    let buffers = RenderBuffers::new(BufferParams::new(8, 24, film.pass_stride));
    pt.copy_to_render_buffers(&buffers);
    for pixel in 0..8 * 24 {
        assert_eq!(buffers.read_u32(pixel * film.pass_stride + film.pass_sample_count.unwrap()), 12);
    }
}

#[test]
fn test_cancel_from_another_thread() {
    let config = test_config();
    let film = KernelFilm::default();
    let mut pt = make_path_trace(&[DeviceType::Cpu], &config, film, reference::kernel_functions());
    pt.reset(BufferParams::new(64, 64, film.pass_stride));

    let (started_tx, started_rx) = mpsc::channel();
    pt.set_buffer_read_callback(move |_| {
        let _ = started_tx.send(());
        false
    });
    let handle = pt.cancel_handle();

    let render_thread = thread::spawn(move || {
        let result = pt.render(&RenderWork::samples(0, 1_000_000));
        (pt, result)
    });

    started_rx.recv().unwrap();
    handle.cancel();
    let (mut pt, result) = render_thread.join().unwrap();

    assert!(result.is_ok());
    assert_eq!(pt.state(), PathTraceState::Canceled);
    assert_eq!(pt.num_samples_in_buffer(), 0);

    // The request is consumed: the next render runs normally.
    pt.render(&RenderWork::samples(0, 1)).unwrap();
    assert_eq!(pt.state(), PathTraceState::Finished);
    assert_eq!(pt.num_samples_in_buffer(), 1);
}

#[test]
fn test_cancel_without_render_in_flight_is_a_no_op() {
    let config = test_config();
    let film = KernelFilm::default();
    let mut pt = make_path_trace(&[DeviceType::Wavefront], &config, film, reference::kernel_functions());
    pt.reset(BufferParams::new(4, 4, film.pass_stride));

    pt.cancel_handle().cancel();
    pt.render(&RenderWork::samples(0, 2)).unwrap();
    assert_eq!(pt.state(), PathTraceState::Finished);
    assert_eq!(pt.num_samples_in_buffer(), 2);
}

fn panicking_shade_background(
    _kg: &KernelGlobals,
    _state: &mut IntegratorState,
    _queue: &PathQueue<'_>,
    _render_buffers: &RenderBuffers,
) {
    panic!("background shader failed");
}

#[test]
fn test_device_error_fails_render() {
    let config = test_config();
    let film = KernelFilm::default();
    let mut kernels = reference::kernel_functions();
    kernels.integrator_shade_background = panicking_shade_background;

    for device_type in [DeviceType::Wavefront, DeviceType::Cpu] {
        let mut pt = make_path_trace(&[device_type], &config, film, kernels);
        pt.reset(BufferParams::new(8, 8, film.pass_stride));

        let err = pt.render(&RenderWork::samples(0, 4)).unwrap_err();
        assert!(matches!(err, RenderError::Device(_)), "{err}");
        assert!(err.to_string().contains("background shader failed"), "{err}");
        assert_eq!(pt.state(), PathTraceState::Failed);
        assert!(pt.render(&RenderWork::samples(4, 4)).is_err());
    }
}

#[test]
fn test_buffer_callbacks() {
    let config = test_config();
    let film = KernelFilm::default();
    let combined = film.pass_combined.unwrap();
    let mut pt = make_path_trace(&[DeviceType::Wavefront], &config, film, reference::kernel_functions());
    pt.reset(BufferParams::new(4, 4, film.pass_stride));

    pt.set_buffer_read_callback(move |buffers| {
        buffers.write(combined, 100.0);
        true
    });
    let updates = Arc::new(Mutex::new(Vec::new()));
    let writes = Arc::new(Mutex::new(Vec::new()));
    {
        let updates = updates.clone();
        pt.set_buffer_update_callback(move |buffers, num_samples| {
            updates.lock().unwrap().push((buffers.read(combined), num_samples));
        });
        let writes = writes.clone();
        pt.set_buffer_write_callback(move |buffers, num_samples| {
            writes.lock().unwrap().push((buffers.params().num_pixels(), num_samples));
        });
    }

    let work = RenderWork {
        init_render_buffers: true,
        update_display: true,
        ..Default::default()
    };
    pt.render(&work).unwrap();
    assert_eq!(updates.lock().unwrap().as_slice(), &[(100.0, 0)]);
    assert!(writes.lock().unwrap().is_empty());

    pt.render(&RenderWork::samples(0, 2).with_write()).unwrap();
    assert_eq!(writes.lock().unwrap().as_slice(), &[(16, 2)]);
    assert_eq!(updates.lock().unwrap().len(), 1);
}

#[test]
fn test_display_update() {
    let config = test_config();
    let film = KernelFilm::default();
    let mut pt = make_path_trace(&[DeviceType::Cpu, DeviceType::Wavefront], &config, film, reference::kernel_functions());
    pt.reset(BufferParams::new(8, 4, film.pass_stride));

    let display = HalfDisplay::new();
    let handle = display.handle();
    pt.set_display(Box::new(display));

    pt.render(&RenderWork::samples(0, 4)).unwrap();
    assert_eq!(handle.num_updates(), 0);

    pt.render(&RenderWork::samples(4, 4).with_display_update()).unwrap();
    let frame = handle.frame();
    assert_eq!(frame.num_updates, 1);
    assert_eq!((frame.width, frame.height), (8, 4));
    for y in 0..4 {
        for x in 0..8 {
            let [r, g, b, a] = frame.pixel(x, y);
            assert!(r > 0.0 && r.is_finite() && r == g && g == b, "({x}, {y}): {r} {g} {b}");
            assert!((0.0..=1.0).contains(&a));
        }
    }
}

#[test]
fn test_denoised_result_goes_stale() {
    let config = test_config();
    let film = denoising_film();
    let mut pt = make_path_trace(&[DeviceType::Cpu], &config, film, reference::kernel_functions());
    pt.reset(BufferParams::new(4, 4, film.pass_stride));

    pt.render(&RenderWork::samples(0, 2).with_denoise()).unwrap();
    assert!(!pt.has_denoised_result(), "no denoiser set");

    pt.set_denoiser(Box::new(BoxFilterDenoiser::new(1)));
    pt.render(&RenderWork::samples(2, 2).with_denoise()).unwrap();
    assert!(pt.has_denoised_result());

    pt.render(&RenderWork::samples(4, 2)).unwrap();
    assert!(!pt.has_denoised_result());
}

#[test]
fn test_denoise_without_denoised_pass_keeps_noisy_result() {
    let config = test_config();
    let film = KernelFilm::default();
    let mut pt = make_path_trace(&[DeviceType::Cpu], &config, film, reference::kernel_functions());
    pt.reset(BufferParams::new(4, 4, film.pass_stride));
    pt.set_denoiser(Box::new(BoxFilterDenoiser::new(1)));

    pt.render(&RenderWork::samples(0, 2).with_denoise()).unwrap();
    assert_eq!(pt.state(), PathTraceState::Finished);
    assert!(!pt.has_denoised_result());
}

fn denoising_film() -> KernelFilm {
    KernelFilm::new(FilmPasses {
        denoising: true,
        ..Default::default()
    })
}

fn noisy_mean(film: &KernelFilm, buffers: &RenderBuffers, pixel: usize) -> f32 {
    let base = pixel * film.pass_stride;
    buffers.read(base + film.pass_combined.unwrap()) / buffers.read_u32(base + film.pass_sample_count.unwrap()) as f32
}

#[test]
fn test_display_shows_denoised_pass() {
    let config = test_config();
    let film = denoising_film();
    let (width, height) = (8, 4);
    let mut pt = make_path_trace(&[DeviceType::Cpu, DeviceType::Wavefront], &config, film, reference::kernel_functions());
    let params = BufferParams::new(width, height, film.pass_stride);
    pt.reset(params);
    pt.set_denoiser(Box::new(BoxFilterDenoiser::new(1)));

    let display = HalfDisplay::new();
    let handle = display.handle();
    pt.set_display(Box::new(display));

    pt.render(&RenderWork::samples(0, 4).with_denoise().with_display_update()).unwrap();
    assert!(pt.has_denoised_result());

    let buffers = RenderBuffers::new(params);
    pt.copy_to_render_buffers(&buffers);
    let noisy: Vec<f32> = (0..width * height).map(|pixel| noisy_mean(&film, &buffers, pixel)).collect();
    let box_mean = |x: usize, y: usize| {
        let (mut sum, mut n) = (0.0, 0.0);
        for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                sum += noisy[ny * width + nx];
                n += 1.0;
            }
        }
        sum / n
    };

    // Every device slice got the denoised pass back, and the display shows it.
    let frame = handle.frame();
    let denoised = film.pass_denoised.unwrap();
    let mut num_changed = 0;
    for y in 0..height {
        for x in 0..width {
            let pixel = y * width + x;
            let expected = box_mean(x, y);
            let stored = buffers.read(pixel * film.pass_stride + denoised)
                / buffers.read_u32(pixel * film.pass_stride + film.pass_sample_count.unwrap()) as f32;
            assert!((stored - expected).abs() <= 1e-4 * expected.max(1.0), "({x}, {y}): {stored} vs {expected}");

            let shown = frame.pixel(x, y)[0];
            assert!((shown - expected).abs() <= 1e-2 * expected.max(1.0), "({x}, {y}): {shown} vs {expected}");
            if (shown - noisy[pixel]).abs() > 1e-2 * noisy[pixel].max(1.0) {
                num_changed += 1;
            }
        }
    }
    assert!(num_changed > 0, "denoising left every displayed pixel unchanged");

    // New samples make the denoised pass stale, the display goes back to the noisy result.
    pt.render(&RenderWork::samples(4, 4).with_display_update()).unwrap();
    assert!(!pt.has_denoised_result());
    pt.copy_to_render_buffers(&buffers);
    let frame = handle.frame();
    for pixel in 0..width * height {
        let expected = noisy_mean(&film, &buffers, pixel);
        let shown = frame.pixel(pixel % width, pixel / width)[0];
        assert!((shown - expected).abs() <= 1e-2 * expected.max(1.0), "pixel {pixel}: {shown} vs {expected}");
    }
}

#[test]
fn test_adaptive_sampling_stops_converged_pixels() {
    let mut config = test_config();
    config.adaptive_sampling.enabled = true;
    let film = KernelFilm::new(FilmPasses {
        adaptive_sampling: true,
        ..Default::default()
    });
    let sample_count = film.pass_sample_count.unwrap();

    for device_type in [DeviceType::Cpu, DeviceType::Wavefront] {
        let mut pt = make_path_trace(&[device_type], &config, film, reference::kernel_functions());
        let params = BufferParams::new(4, 4, film.pass_stride);
        pt.reset(params);

        pt.render(&RenderWork::samples(0, 8).with_adaptive_filter(Some(1e9), false))
            .unwrap();
        assert!(pt.is_adaptive_sampling_converged());

        pt.render(&RenderWork::samples(8, 8)).unwrap();
        let buffers = RenderBuffers::new(params);
        pt.copy_to_render_buffers(&buffers);
        for pixel in 0..16 {
            assert_eq!(buffers.read_u32(pixel * film.pass_stride + sample_count), 8, "{device_type:?}");
        }
    }
}
