//! Speaker and microphone adapters over `cpal`.
//!
//! Device callbacks run on audio threads, so samples cross into the async
//! side through lock-free ring buffers. The `cpal::Stream` handles are not
//! `Send`; callers keep them alive on the main task while the sink and
//! source move into the translator.

use crate::resample::StreamResampler;
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};
use sonic_core::audio::{AudioSink, AudioSource};
use sonic_core::pcm;
use sonic_realtime::codec::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// Seconds of audio each ring buffer can hold.
const BUFFER_SECONDS: usize = 30;
/// Resampler input chunk, in device-rate samples.
const RESAMPLE_CHUNK: usize = 480;
/// 20 ms of 16 kHz audio per captured frame.
const CAPTURE_FRAME_SAMPLES: usize = 320;
const CAPTURE_POLL: Duration = Duration::from_millis(10);

/// Plays 24 kHz PCM16 through the default output device.
pub struct SpeakerSink {
    producer: HeapProd<f32>,
    resampler: StreamResampler,
}

#[async_trait]
impl AudioSink for SpeakerSink {
    async fn write(&mut self, pcm: &[u8]) -> anyhow::Result<()> {
        let samples = self.resampler.process(&pcm::pcm16_to_f32(pcm))?;
        let pushed = self.producer.push_slice(&samples);
        if pushed < samples.len() {
            trace!(dropped = samples.len() - pushed, "Speaker buffer full.");
        }
        Ok(())
    }
}

/// Opens the default output device. The returned stream must outlive the sink.
pub fn open_speaker() -> anyhow::Result<(Stream, SpeakerSink)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("No output device available"))?;
    let supported = device
        .default_output_config()
        .context("Failed to query the output device")?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let device_rate = config.sample_rate.0;
    info!(
        device = %device.name().unwrap_or_default(),
        sample_rate = device_rate,
        channels = config.channels,
        "Opening speaker."
    );

    let ring = HeapRb::<f32>::new(device_rate as usize * BUFFER_SECONDS);
    let (producer, consumer) = ring.split();
    let stream = match format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, consumer)?,
        SampleFormat::I16 => build_output::<i16>(&device, &config, consumer)?,
        SampleFormat::U16 => build_output::<u16>(&device, &config, consumer)?,
        other => bail!("Unsupported output sample format: {:?}", other),
    };
    stream.play().context("Failed to start playback")?;

    let resampler = StreamResampler::new(OUTPUT_SAMPLE_RATE, device_rate, RESAMPLE_CHUNK)?;
    Ok((
        stream,
        SpeakerSink {
            producer,
            resampler,
        },
    ))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: HeapCons<f32>,
) -> anyhow::Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for frame in data.chunks_mut(channels) {
                let value = consumer.try_pop().unwrap_or(0.0);
                for sample in frame.iter_mut() {
                    *sample = T::from_sample(value);
                }
            }
        },
        |err| error!(error = %err, "Output stream error."),
        None,
    )?;
    Ok(stream)
}

/// Captures the default input device as 16 kHz PCM16 frames.
pub struct MicrophoneSource {
    consumer: HeapCons<f32>,
    resampler: StreamResampler,
    ready: Vec<f32>,
}

#[async_trait]
impl AudioSource for MicrophoneSource {
    async fn read_frame(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        let mut scratch = vec![0.0f32; RESAMPLE_CHUNK];
        loop {
            if self.ready.len() >= CAPTURE_FRAME_SAMPLES {
                let frame: Vec<f32> = self.ready.drain(..CAPTURE_FRAME_SAMPLES).collect();
                return Ok(Some(pcm::f32_to_pcm16(&frame)));
            }
            if self.consumer.occupied_len() == 0 {
                tokio::time::sleep(CAPTURE_POLL).await;
                continue;
            }
            let read = self.consumer.pop_slice(&mut scratch);
            let converted = self.resampler.process(&scratch[..read])?;
            self.ready.extend(converted);
        }
    }
}

/// Opens the default input device. The returned stream must outlive the source.
pub fn open_microphone() -> anyhow::Result<(Stream, MicrophoneSource)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("No input device available"))?;
    let supported = device
        .default_input_config()
        .context("Failed to query the input device")?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let device_rate = config.sample_rate.0;
    info!(
        device = %device.name().unwrap_or_default(),
        sample_rate = device_rate,
        channels = config.channels,
        "Opening microphone."
    );

    let ring = HeapRb::<f32>::new(device_rate as usize * BUFFER_SECONDS);
    let (producer, consumer) = ring.split();
    let stream = match format {
        SampleFormat::F32 => build_input::<f32>(&device, &config, producer)?,
        SampleFormat::I16 => build_input::<i16>(&device, &config, producer)?,
        SampleFormat::U16 => build_input::<u16>(&device, &config, producer)?,
        other => bail!("Unsupported input sample format: {:?}", other),
    };
    stream.play().context("Failed to start capture")?;

    let resampler = StreamResampler::new(device_rate, INPUT_SAMPLE_RATE, RESAMPLE_CHUNK)?;
    Ok((
        stream,
        MicrophoneSource {
            consumer,
            resampler,
            ready: Vec::new(),
        },
    ))
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: HeapProd<f32>,
) -> anyhow::Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // Down-mix to mono.
            for frame in data.chunks(channels) {
                let sum: f32 = frame.iter().map(|s| f32::from_sample(*s)).sum();
                if producer.try_push(sum / channels as f32).is_err() {
                    break;
                }
            }
        },
        |err| error!(error = %err, "Input stream error."),
        None,
    )?;
    debug!("Input stream built.");
    Ok(stream)
}
