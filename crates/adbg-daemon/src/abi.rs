//! ABI Resolver
//!
//! Picks the CPU ABI used for a device/app pair. The device's own preference
//! order is authoritative; the app's supported list only filters it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use adbg_core::prelude::*;
use adbg_core::CancelSignal;

use crate::adb::DeviceChannel;

/// ABIs assumed supported when the app does not declare any.
pub const DEFAULT_SUPPORTED_ABIS: &[&str] = &["armeabi-v7a", "arm64-v8a", "x86", "x86_64"];

/// Sentinel value requesting interactive selection.
pub const SELECT_ABI: &str = "select";

/// Read the device's ABI list in preference order.
///
/// `ro.product.cpu.abi` first, then `ro.product.cpu.abilist`. Devices that
/// predate the list property report `abi` and `abi2` instead.
pub async fn device_abis<C: DeviceChannel + Sync>(channel: &C) -> Result<Vec<String>> {
    let primary = channel.getprop("ro.product.cpu.abi").await?;
    let list = channel.getprop("ro.product.cpu.abilist").await?;

    let mut abis: Vec<String> = vec![primary.clone()];
    if list.trim().is_empty() {
        abis.push(channel.getprop("ro.product.cpu.abi2").await?);
    } else {
        abis.extend(list.split(',').map(|s| s.trim().to_string()));
    }

    let mut seen = Vec::with_capacity(abis.len());
    for abi in abis {
        if !abi.is_empty() && !seen.contains(&abi) {
            seen.push(abi);
        }
    }
    debug!("Device {} ABIs: {:?}", channel.serial(), seen);
    Ok(seen)
}

/// First device ABI that the app supports.
///
/// `app_supported` of `None` means [`DEFAULT_SUPPORTED_ABIS`].
pub fn best_abi(device: &[String], app_supported: Option<&[String]>) -> Result<String> {
    let defaults: Vec<String>;
    let app = match app_supported {
        Some(list) => list,
        None => {
            defaults = DEFAULT_SUPPORTED_ABIS.iter().map(|s| s.to_string()).collect();
            &defaults
        }
    };

    device
        .iter()
        .find(|abi| app.contains(abi))
        .cloned()
        .ok_or_else(|| Error::NoCompatibleAbi {
            device: device.to_vec(),
            app: app.to_vec(),
        })
}

/// How the ABI for a session is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AbiRequest {
    /// Intersect device and app lists.
    #[default]
    Auto,
    /// Use exactly this ABI.
    Explicit(String),
    /// Ask the user.
    Select,
}

impl AbiRequest {
    pub fn from_option(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => AbiRequest::Auto,
            Some(SELECT_ABI) => AbiRequest::Select,
            Some(abi) => AbiRequest::Explicit(abi.to_string()),
        }
    }
}

/// Interactive ABI picker collaborator.
#[trait_variant::make(AbiPrompt: Send)]
pub trait LocalAbiPrompt {
    /// Offer `choices`, pre-selecting `last` if present. `None` means the user
    /// dismissed the prompt.
    async fn pick(&self, choices: &[String], last: Option<&str>) -> Option<String>;
}

/// Prompt used when no interactive picker exists: takes the remembered ABI,
/// else the first choice.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstChoicePrompt;

impl AbiPrompt for FirstChoicePrompt {
    async fn pick(&self, choices: &[String], last: Option<&str>) -> Option<String> {
        last.filter(|l| choices.iter().any(|c| c == l))
            .map(str::to_string)
            .or_else(|| choices.first().cloned())
    }
}

/// Last ABI picked interactively, shared across sessions.
#[derive(Debug, Clone, Default)]
pub struct AbiMemory {
    last: Arc<Mutex<Option<String>>>,
}

impl AbiMemory {
    pub fn get(&self) -> Option<String> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, abi: &str) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(abi.to_string());
    }

    pub fn clear(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Per-request ABI state bridging the Resolving and Starting phases.
///
/// The ABI is computed at most once: later calls to [`Self::resolve`] return
/// the memoized value without touching the device or prompting again.
#[derive(Debug, Default)]
pub struct AbiResolutionContext {
    request: AbiRequest,
    app_supported: Option<Vec<String>>,
    map: HashMap<String, String>,
    resolved: OnceCell<String>,
}

impl AbiResolutionContext {
    pub fn new(
        request: AbiRequest,
        app_supported: Option<Vec<String>>,
        map: HashMap<String, String>,
    ) -> Self {
        Self {
            request,
            app_supported,
            map,
            resolved: OnceCell::new(),
        }
    }

    /// The resolved ABI, if [`Self::resolve`] already succeeded.
    pub fn resolved(&self) -> Option<&str> {
        self.resolved.get().map(String::as_str)
    }

    /// Toolchain identifier for `abi` after applying the remap table.
    pub fn mapped(&self, abi: &str) -> String {
        self.map.get(abi).cloned().unwrap_or_else(|| abi.to_string())
    }

    /// Resolve the ABI once for this session.
    pub async fn resolve<C, P>(
        &self,
        channel: &C,
        prompt: &P,
        memory: &AbiMemory,
        cancel: &CancelSignal,
    ) -> Result<String>
    where
        C: DeviceChannel + Sync,
        P: AbiPrompt + Sync,
    {
        let abi = self
            .resolved
            .get_or_try_init(|| {
                cancel.guard(async {
                    match &self.request {
                        AbiRequest::Explicit(abi) => {
                            debug!("Using explicit ABI {}", abi);
                            Ok(abi.clone())
                        }
                        AbiRequest::Auto => {
                            let device = device_abis(channel).await?;
                            best_abi(&device, self.app_supported.as_deref())
                        }
                        AbiRequest::Select => {
                            let device = device_abis(channel).await?;
                            let choices = self.selectable(&device);
                            if choices.is_empty() {
                                return Err(Error::NoCompatibleAbi {
                                    device,
                                    app: self.app_list(),
                                });
                            }
                            let picked = prompt
                                .pick(&choices, memory.get().as_deref())
                                .await
                                .ok_or(Error::Cancelled)?;
                            memory.set(&picked);
                            Ok(picked)
                        }
                    }
                })
            })
            .await?;

        info!("Resolved ABI {}", abi);
        Ok(abi.clone())
    }

    fn app_list(&self) -> Vec<String> {
        self.app_supported.clone().unwrap_or_else(|| {
            DEFAULT_SUPPORTED_ABIS
                .iter()
                .map(|s| s.to_string())
                .collect()
        })
    }

    fn selectable(&self, device: &[String]) -> Vec<String> {
        let app = self.app_list();
        device.iter().filter(|a| app.contains(a)).cloned().collect()
    }
}
