//! polyhost - live demo of the host core
//!
//! Creates one host, one synth instance, and one looping sequencer, then
//! drives the render loop from the system audio output.
//!
//! Run with: cargo run

use std::sync::Arc;

use color_eyre::eyre::{eyre, Result as EyreResult, WrapErr};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use polyhost::engine::basic::BasicEngineFactory;
use polyhost::host::SynthHost;
use polyhost::MAX_BLOCK_SIZE;

fn main() -> EyreResult<()> {
    color_eyre::install()?;
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| eyre!("no default output device available"))?;
    let config = device
        .default_output_config()
        .wrap_err("failed to fetch default output config")?;

    let sample_rate = config.sample_rate().0 as f64;
    let channels = config.channels() as usize;

    println!("=== polyhost ===");
    println!("Sample rate: {} Hz", sample_rate);
    println!("Channels: {}", channels);

    let host = Arc::new(SynthHost::new(Box::new(BasicEngineFactory::new())));
    host.set_bpm(120.0);
    println!("Registered parameters: {}", host.parameter_definitions().len());

    let instance = host.create_instance(sample_rate as f32);

    // One bar of looping arpeggio; times are in sixteenths.
    let sequencer = host.create_sequencer();
    host.set_sequencer_channel(sequencer, 0);
    host.set_sequencer_length(sequencer, 16.0);
    host.set_sequencer_loop(sequencer, true);
    for (i, key) in [60u8, 64, 67, 72, 67, 64].iter().enumerate() {
        host.create_note(sequencer, *key, 0.8, (i * 2) as f64, (i * 2) as f64 + 1.5);
    }
    host.enable_sequencer(sequencer, true);

    println!("Playing... Press Ctrl+C to stop");

    let render_host = host.clone();
    let render_instance = instance.clone();
    // The host multiplies engine output by the input buffer; feed unity gain.
    let input = vec![1.0f32; MAX_BLOCK_SIZE];
    let mut block = vec![0.0f32; MAX_BLOCK_SIZE];

    let stream = device.build_output_stream(
        &config.into(),
        move |data: &mut [f32], _| {
            let total_frames = data.len() / channels;
            let mut frames_written = 0;

            while frames_written < total_frames {
                let frames = (total_frames - frames_written).min(MAX_BLOCK_SIZE / channels);
                let out = &mut block[..frames * channels];

                render_host.process_block(
                    &render_instance,
                    &input[..frames],
                    out,
                    frames,
                    1,
                    channels,
                    false,
                    sample_rate,
                );

                let offset = frames_written * channels;
                data[offset..offset + frames * channels].copy_from_slice(out);
                frames_written += frames;
            }
        },
        |err| eprintln!("Audio error: {}", err),
        None,
    )?;

    stream.play()?;

    loop {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
}
