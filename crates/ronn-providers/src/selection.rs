//! Automatic execution provider selection.
//!
//! Turns a device policy into an ordered list of live provider instances and
//! attaches them to a session. With [`DevicePolicy::PreferCpu`] providers are
//! ranked in four fixed slots:
//!
//! 1. a provider targeting an NPU
//! 2. a provider targeting a GPU
//! 3. a third-party provider targeting a CPU
//! 4. the built-in CPU provider, unless `session.disable_cpu_ep_fallback=1`
//!
//! A provider occupies the slot of the highest-priority device kind it
//! supports and is created for the first such device. When two providers
//! compete for a slot the one registered first wins. Either every selected
//! provider is created and attached, or the session is left without providers
//! and its options unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use ronn_core::{
    provider_option_key, CoreError, DevicePolicy, ExecutionProvider, HardwareDevice,
    HardwareDeviceKind, InferenceSession, Result,
};
use tracing::{debug, error, info, warn};

use crate::cpu::CPU_EXECUTION_PROVIDER;
use crate::factory::EpFactory;
use crate::registry::{ExecutionDevice, ProviderRegistry};

/// User callback choosing execution devices.
pub type SelectionDelegate =
    Arc<dyn Fn(&[Arc<ExecutionDevice>]) -> Vec<Arc<ExecutionDevice>> + Send + Sync>;

/// How providers are chosen for a session.
#[derive(Clone)]
pub enum EpSelection {
    /// A built-in device policy.
    Policy(DevicePolicy),
    /// A user callback. Not supported yet.
    Delegate(SelectionDelegate),
}

impl fmt::Debug for EpSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Policy(policy) => f.debug_tuple("Policy").field(policy).finish(),
            Self::Delegate(_) => f.write_str("Delegate(..)"),
        }
    }
}

impl From<DevicePolicy> for EpSelection {
    fn from(policy: DevicePolicy) -> Self {
        Self::Policy(policy)
    }
}

/// Priority slot of a selected provider, in instantiation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Slot {
    Npu,
    Gpu,
    Cpu,
    DefaultCpu,
}

/// All execution devices of one provider.
struct Candidate<'a> {
    factory: Arc<EpFactory>,
    devices: Vec<&'a ExecutionDevice>,
}

impl<'a> Candidate<'a> {
    fn is_default_cpu(&self, ep_name: &str) -> bool {
        ep_name == CPU_EXECUTION_PROVIDER && self.factory.is_internal()
    }

    fn devices_of_kind(&self, kind: HardwareDeviceKind) -> Vec<&'a ExecutionDevice> {
        self.devices
            .iter()
            .copied()
            .filter(|device| device.device().kind == kind)
            .collect()
    }

    /// Slot this provider competes for and the device it gets there.
    ///
    /// Factories are handed one device per instance: the first matched device
    /// of the slot's kind, in discovery order.
    fn slot(&self, ep_name: &str) -> Option<(Slot, &'a ExecutionDevice)> {
        let kinds: &[(Slot, HardwareDeviceKind)] = if self.is_default_cpu(ep_name) {
            &[(Slot::DefaultCpu, HardwareDeviceKind::Cpu)]
        } else {
            &[
                (Slot::Npu, HardwareDeviceKind::Npu),
                (Slot::Gpu, HardwareDeviceKind::Gpu),
                (Slot::Cpu, HardwareDeviceKind::Cpu),
            ]
        };

        kinds.iter().find_map(|&(slot, kind)| {
            let matched = self.devices_of_kind(kind);
            let first = *matched.first()?;
            if matched.len() > 1 {
                debug!(
                    "Execution provider '{}' matched {} {:?} devices, using {}",
                    ep_name,
                    matched.len(),
                    kind,
                    first.device()
                );
            }
            Some((slot, first))
        })
    }
}

/// A provider chosen for one slot.
struct Selected<'a> {
    ep_name: &'a str,
    factory: Arc<EpFactory>,
    device: &'a ExecutionDevice,
}

/// Group execution devices by provider name, keeping registration order.
fn group_candidates(devices: &[Arc<ExecutionDevice>]) -> Result<IndexMap<&str, Candidate<'_>>> {
    let mut candidates: IndexMap<&str, Candidate<'_>> = IndexMap::new();

    for device in devices {
        let factory = device.factory()?;
        let candidate = candidates
            .entry(device.ep_name())
            .or_insert_with(|| Candidate {
                factory: Arc::clone(&factory),
                devices: Vec::new(),
            });

        if !Arc::ptr_eq(&candidate.factory, &factory) {
            return Err(CoreError::fail(format!(
                "execution provider '{}' is provided by more than one factory",
                device.ep_name()
            )));
        }
        candidate.devices.push(&**device);
    }

    Ok(candidates)
}

fn assign_slots<'a>(
    candidates: &IndexMap<&'a str, Candidate<'a>>,
    cpu_fallback: bool,
) -> BTreeMap<Slot, Selected<'a>> {
    let mut slots: BTreeMap<Slot, Selected<'a>> = BTreeMap::new();

    for (&ep_name, candidate) in candidates {
        let Some((slot, device)) = candidate.slot(ep_name) else {
            continue;
        };

        if slot == Slot::DefaultCpu && !cpu_fallback {
            debug!("CPU execution provider fallback is disabled");
            continue;
        }

        if let Some(winner) = slots.get(&slot) {
            warn!(
                "Execution provider '{}' not selected: '{}' was registered first for the {:?} slot",
                ep_name, winner.ep_name, slot
            );
            continue;
        }

        slots.insert(
            slot,
            Selected {
                ep_name,
                factory: Arc::clone(&candidate.factory),
                device,
            },
        );
    }

    slots
}

/// Choose providers for `session` with `selection` and attach them.
///
/// Errors:
/// - `NotImplemented` for a delegate or any policy other than `PreferCpu`
/// - `InvalidArgument` if no provider qualifies
/// - the first creation error, after which the session has no providers and
///   the option defaults seeded for the selected providers are removed again
pub fn select_and_attach(
    registry: &ProviderRegistry,
    session: &mut InferenceSession,
    selection: &EpSelection,
) -> Result<()> {
    match selection {
        EpSelection::Delegate(_) => {
            return Err(CoreError::not_implemented(
                "execution provider selection delegates are not supported",
            ));
        }
        EpSelection::Policy(DevicePolicy::PreferCpu) => {}
        EpSelection::Policy(policy) => {
            return Err(CoreError::not_implemented(format!(
                "device policy '{policy}' is not supported"
            )));
        }
    }

    let snapshot = registry.execution_devices()?;
    let candidates = group_candidates(&snapshot)?;
    let cpu_fallback = !session.options().is_cpu_ep_fallback_disabled();
    let selected = assign_slots(&candidates, cpu_fallback);

    if selected.is_empty() {
        return Err(CoreError::invalid_argument("no execution providers selected"));
    }

    let seeded = match seed_provider_options(session, &selected) {
        Ok(seeded) => seeded,
        Err((seeded, e)) => {
            rollback_options(session, &seeded);
            return Err(e);
        }
    };

    let mut providers: Vec<Box<dyn ExecutionProvider>> = Vec::with_capacity(selected.len());
    for (slot, choice) in &selected {
        let devices: [Arc<HardwareDevice>; 1] = [Arc::clone(choice.device.device())];
        let metadata = [choice.device.ep_metadata().clone()];

        debug!(
            "Creating execution provider '{}' for the {:?} slot on {}",
            choice.ep_name, slot, devices[0]
        );

        match choice
            .factory
            .create_ep(&devices, &metadata, session.options(), session.logger())
        {
            Ok(provider) => providers.push(provider),
            Err(e) => {
                error!(
                    "Failed to create execution provider '{}': {}",
                    choice.ep_name, e
                );
                drop(providers);
                rollback_options(session, &seeded);
                return Err(e);
            }
        }
    }

    let names: Vec<String> = providers
        .iter()
        .map(|provider| provider.provider_type().to_string())
        .collect();
    if let Err(e) = session.register_execution_providers(providers) {
        rollback_options(session, &seeded);
        return Err(e);
    }

    info!(
        "Selected execution providers for session {}: {:?}",
        session.id(),
        names
    );
    Ok(())
}

/// Write each advertised option as `ep.<name>.<key>` unless already set.
///
/// Returns the keys that were added. On error the keys added so far are
/// returned with it.
fn seed_provider_options(
    session: &mut InferenceSession,
    selected: &BTreeMap<Slot, Selected<'_>>,
) -> std::result::Result<Vec<String>, (Vec<String>, CoreError)> {
    let mut seeded = Vec::new();
    let config = &mut session.options_mut().config_options;

    for choice in selected.values() {
        for (option, value) in choice.device.ep_options() {
            let key = provider_option_key(choice.ep_name, option);
            match config.set_if_absent(key.clone(), value.clone()) {
                Ok(true) => seeded.push(key),
                Ok(false) => {}
                Err(e) => return Err((seeded, e)),
            }
        }
    }

    Ok(seeded)
}

fn rollback_options(session: &mut InferenceSession, seeded: &[String]) {
    let config = &mut session.options_mut().config_options;
    for key in seeded {
        config.remove(key);
    }
    if !seeded.is_empty() {
        debug!("Rolled back {} seeded provider options", seeded.len());
    }
}
