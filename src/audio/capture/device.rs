//! Loopback capture through cpal
//!
//! On Windows cpal can open an input stream on the default output device,
//! which WASAPI serves as loopback. On PulseAudio/PipeWire systems the
//! playback mix is exposed as a "monitor" input device instead. Platforms
//! without either report `CaptureError::NoDevice`.

use super::{
    to_stereo, CaptureError, CaptureSource, CaptureThread, DeliverFn, ReadySender, StreamFormat,
};
use crate::diagnostics::DiagnosticLog;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, StreamConfig, SupportedStreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Loopback capture of the system mix via cpal
pub struct DeviceLoopback {
    poll_interval: Duration,
    thread: Option<CaptureThread>,
}

impl DeviceLoopback {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            thread: None,
        }
    }
}

impl CaptureSource for DeviceLoopback {
    fn name(&self) -> &'static str {
        "cpal loopback"
    }

    fn initialize(
        &mut self,
        deliver: DeliverFn,
        diagnostics: Arc<DiagnosticLog>,
    ) -> Result<StreamFormat, CaptureError> {
        if self.thread.is_some() {
            return Err(CaptureError::Thread("capture already running".to_string()));
        }

        let poll_interval = self.poll_interval;
        // cpal::Stream is not Send, so the thread builds, owns and drops it.
        let (thread, format) = CaptureThread::spawn(move |running, ready| {
            run_capture_thread(running, ready, deliver, diagnostics, poll_interval)
        })?;

        self.thread = Some(thread);
        Ok(format)
    }

    fn shutdown(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.stop();
        }
    }
}

impl Drop for DeviceLoopback {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Find the device carrying the playback mix and its native config
fn find_loopback_device(
    host: &cpal::Host,
) -> Result<(Device, SupportedStreamConfig), CaptureError> {
    if cfg!(target_os = "windows") {
        // WASAPI loopback: build an input stream on the default output device
        let device = host
            .default_output_device()
            .ok_or(CaptureError::NoDevice)?;
        let config = device
            .default_output_config()
            .map_err(|e| CaptureError::Config(format!("Loopback config: {}", e)))?;
        return Ok((device, config));
    }

    let monitor = host
        .input_devices()
        .map_err(|e| CaptureError::Config(e.to_string()))?
        .find(|d| {
            d.name()
                .map(|n| n.to_lowercase().contains("monitor"))
                .unwrap_or(false)
        })
        .ok_or(CaptureError::NoDevice)?;

    let config = monitor
        .default_input_config()
        .map_err(|e| CaptureError::Config(e.to_string()))?;
    Ok((monitor, config))
}

/// Body of the capture thread
fn run_capture_thread(
    running: Arc<AtomicBool>,
    ready: ReadySender,
    deliver: DeliverFn,
    diagnostics: Arc<DiagnosticLog>,
    poll_interval: Duration,
) {
    let failed = Arc::new(AtomicBool::new(false));

    let stream = match open_stream(deliver, diagnostics.clone(), failed.clone()) {
        Ok((stream, format)) => {
            let _ = ready.send(Ok(format));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while running.load(Ordering::SeqCst) {
        if failed.load(Ordering::SeqCst) {
            diagnostics.error("Capture stream failed; no further live samples");
            break;
        }
        thread::sleep(poll_interval);
    }

    drop(stream);
    diagnostics.info("cpal capture loop exited");
}

/// Build and start the loopback stream
fn open_stream(
    deliver: DeliverFn,
    diagnostics: Arc<DiagnosticLog>,
    failed: Arc<AtomicBool>,
) -> Result<(cpal::Stream, StreamFormat), CaptureError> {
    let host = cpal::default_host();
    let (device, config) = find_loopback_device(&host)?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let format = StreamFormat {
        sample_rate: config.sample_rate().0,
        channels: config.channels(),
    };
    let sample_format = config.sample_format();

    let on_error = move |err: cpal::StreamError| {
        diagnostics.error(&format!("Audio stream error: {}", err));
        failed.store(true, Ordering::SeqCst);
    };

    let stream_config: StreamConfig = config.into();
    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, deliver, on_error),
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, deliver, on_error),
        SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, deliver, on_error),
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, deliver, on_error),
        other => {
            return Err(CaptureError::UnsupportedFormat(format!("{:?}", other)));
        }
    }
    .map_err(|e| CaptureError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::Play(e.to_string()))?;

    log::info!(
        "Loopback capture on {}: {} Hz, {} channels, {:?}",
        device_name,
        format.sample_rate,
        format.channels,
        sample_format
    );

    Ok((stream, format))
}

/// Build an input stream that converts to stereo f32 before delivery
fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut deliver: DeliverFn,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: Sample + cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels as usize;
    let mut converted: Vec<f32> = Vec::with_capacity(4096);
    let mut stereo: Vec<f32> = Vec::with_capacity(4096);

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            converted.clear();
            converted.extend(data.iter().map(|&s| f32::from_sample(s)));
            to_stereo(&converted, channels, &mut stereo);
            deliver(&stereo);
        },
        on_error,
        None,
    )
}
