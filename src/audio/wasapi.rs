//! WASAPI mixer for the default render device
//!
//! Stream keys are owning process ids. A session is resolved again on every
//! volume call, so a stream that ended since the last rebuild simply fails
//! that call.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use windows::core::Interface;
use windows::Win32::Foundation::CloseHandle;
use windows::Win32::Media::Audio::Endpoints::IAudioEndpointVolume;
use windows::Win32::Media::Audio::{
    eMultimedia, eRender, AudioSessionStateActive, IAudioSessionControl2, IAudioSessionManager2,
    IMMDeviceEnumerator, ISimpleAudioVolume, MMDeviceEnumerator,
};
use windows::Win32::System::Com::{CoCreateInstance, CoInitializeEx, CLSCTX_ALL, COINIT_MULTITHREADED};
use windows::Win32::System::ProcessStatus::GetModuleBaseNameW;
use windows::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ};

use super::{AudioMixer, AudioStream, SessionChangeCallback};
use crate::error::ProviderError;

const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct WasapiMixer {
    callbacks: Arc<Mutex<Vec<SessionChangeCallback>>>,
    poller_started: AtomicBool,
    stop: Arc<AtomicBool>,
}

impl WasapiMixer {
    pub fn new() -> Self {
        Self {
            callbacks: Arc::new(Mutex::new(Vec::new())),
            poller_started: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn start_poller(&self) {
        if self.poller_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = Arc::clone(&self.callbacks);
        let stop = Arc::clone(&self.stop);

        let spawned = std::thread::Builder::new()
            .name("wasapi-sessions".into())
            .spawn(move || {
                let mut previous = session_fingerprint();
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(SESSION_POLL_INTERVAL);
                    let current = session_fingerprint();
                    if current != previous {
                        debug!("Audio session set changed ({} sessions)", current.len());
                        for cb in callbacks.lock().iter() {
                            cb();
                        }
                        previous = current;
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("Could not start audio session poller: {}", e);
        }
    }
}

impl Default for WasapiMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WasapiMixer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl AudioMixer for WasapiMixer {
    fn name(&self) -> &str {
        "wasapi"
    }

    fn active_streams(&self) -> Result<Vec<AudioStream>, ProviderError> {
        let sessions = active_sessions().map_err(mixer_err)?;
        Ok(sessions
            .into_iter()
            .filter_map(|(pid, _)| {
                let name = process_name(pid);
                (!name.is_empty()).then(|| AudioStream::new(pid.to_string(), name))
            })
            .collect())
    }

    fn set_stream_volume(&self, stream: &AudioStream, percent: u8) -> Result<(), ProviderError> {
        let pid: u32 = stream
            .key
            .parse()
            .map_err(|_| ProviderError::Mixer(format!("bad stream key '{}'", stream.key)))?;
        let scalar = f32::from(percent.min(100)) / 100.0;

        let mut applied = 0usize;
        for (session_pid, session) in active_sessions().map_err(mixer_err)? {
            if session_pid != pid {
                continue;
            }
            let volume: ISimpleAudioVolume = session.cast().map_err(mixer_err)?;
            unsafe { volume.SetMasterVolume(scalar, std::ptr::null()) }.map_err(mixer_err)?;
            applied += 1;
        }

        if applied == 0 {
            return Err(ProviderError::Mixer(format!(
                "session for {} (pid {}) is gone",
                stream.display_name, pid
            )));
        }
        trace!("{} (pid {}) -> {}%", stream.display_name, pid, percent);
        Ok(())
    }

    fn set_master_volume(&self, percent: u8) -> Result<(), ProviderError> {
        let scalar = f32::from(percent.min(100)) / 100.0;
        unsafe {
            init_com();
            let enumerator: IMMDeviceEnumerator =
                CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL).map_err(mixer_err)?;
            let device = enumerator
                .GetDefaultAudioEndpoint(eRender, eMultimedia)
                .map_err(mixer_err)?;
            let endpoint: IAudioEndpointVolume =
                device.Activate(CLSCTX_ALL, None).map_err(mixer_err)?;
            endpoint
                .SetMasterVolumeLevelScalar(scalar, std::ptr::null())
                .map_err(mixer_err)?;
        }
        Ok(())
    }

    fn subscribe_session_changes(&self, callback: SessionChangeCallback) {
        self.callbacks.lock().push(callback);
        self.start_poller();
    }
}

fn mixer_err(e: windows::core::Error) -> ProviderError {
    ProviderError::Mixer(e.to_string())
}

/// COM is initialized per thread; repeated calls on the same thread are harmless
unsafe fn init_com() {
    let _ = CoInitializeEx(None, COINIT_MULTITHREADED);
}

fn session_manager() -> windows::core::Result<IAudioSessionManager2> {
    unsafe {
        init_com();
        let enumerator: IMMDeviceEnumerator = CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)?;
        let device = enumerator.GetDefaultAudioEndpoint(eRender, eMultimedia)?;
        device.Activate(CLSCTX_ALL, None)
    }
}

/// Active sessions on the default device with their owning pid
fn active_sessions() -> windows::core::Result<Vec<(u32, IAudioSessionControl2)>> {
    let manager = session_manager()?;
    let mut out = Vec::new();
    unsafe {
        let sessions = manager.GetSessionEnumerator()?;
        for i in 0..sessions.GetCount()? {
            let Ok(session) = sessions.GetSession(i) else { continue };
            if !matches!(session.GetState(), Ok(state) if state == AudioSessionStateActive) {
                continue;
            }
            let Ok(control) = session.cast::<IAudioSessionControl2>() else { continue };
            match control.GetProcessId() {
                // pid 0 is the system sounds session
                Ok(pid) if pid != 0 => out.push((pid, control)),
                _ => {},
            }
        }
    }
    Ok(out)
}

fn session_fingerprint() -> BTreeSet<(u32, String)> {
    match active_sessions() {
        Ok(sessions) => sessions
            .into_iter()
            .map(|(pid, _)| (pid, process_name(pid)))
            .collect(),
        Err(e) => {
            trace!("Session poll failed: {}", e);
            BTreeSet::new()
        },
    }
}

/// Process base name without extension, or empty if it cannot be read
fn process_name(pid: u32) -> String {
    unsafe {
        let Ok(handle) = OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid) else {
            return String::new();
        };
        let mut buffer = [0u16; 260];
        let len = GetModuleBaseNameW(handle, None, &mut buffer);
        let _ = CloseHandle(handle);
        if len == 0 {
            return String::new();
        }
        let name = String::from_utf16_lossy(&buffer[..len as usize]);
        match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => name,
        }
    }
}
