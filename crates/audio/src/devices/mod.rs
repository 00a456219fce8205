//! Concrete pipeline endpoints: dummy, WAV file and hardware devices.

mod dummy;
mod hardware;
mod wav;

pub use dummy::{NullSink, SilenceSource};
pub use hardware::{MicrophoneSource, SpeakerSink};
pub use wav::{WavFileSink, WavFileSource};

use cpal::traits::{DeviceTrait, HostTrait};

#[derive(Debug, Clone, serde::Serialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

pub fn list_input_devices() -> crate::Result<Vec<AudioDevice>> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    collect_devices(host.input_devices()?, default_name)
}

pub fn list_output_devices() -> crate::Result<Vec<AudioDevice>> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    collect_devices(host.output_devices()?, default_name)
}

fn collect_devices(
    devices: impl Iterator<Item = cpal::Device>,
    default_name: Option<String>,
) -> crate::Result<Vec<AudioDevice>> {
    let mut out = Vec::new();
    for device in devices {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let is_default = default_name.as_ref() == Some(&name);
        out.push(AudioDevice {
            id: name.clone(),
            name,
            is_default,
        });
    }
    Ok(out)
}
