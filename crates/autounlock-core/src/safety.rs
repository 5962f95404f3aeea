//! Reserved-slot safety validation and slot cleanup planning.
//!
//! The single rule every path here honours: a slot the operator's credential
//! can currently open is never removed. Slot 0 is never a candidate at all.

use crate::credential::Credential;
use crate::error::{AutoUnlockError, AutoUnlockResult};
use autounlock_provider::luks::{
    HeaderFormat, HeaderMetadata, KeyMaterial, LuksProvider, ORIGINAL_SLOT, RESERVED_SLOT,
};
use log::{info, warn};
use serde::Serialize;
use std::fmt;

/// Observed content of the reserved slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservedSlotState {
    /// Header format has no reserved slot.
    Unsupported,
    Empty,
    /// Holds a key annotated as a previous hardware key.
    HardwareAnnotated,
    /// Holds a key of unknown origin.
    Other,
    /// Header inspection failed.
    Error,
}

impl ReservedSlotState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservedSlotState::Unsupported => "unsupported",
            ReservedSlotState::Empty => "empty",
            ReservedSlotState::HardwareAnnotated => "hardware_annotated",
            ReservedSlotState::Other => "other",
            ReservedSlotState::Error => "error",
        }
    }

    /// Classify slot 31 of an already-read header.
    pub fn of(header: &HeaderMetadata) -> Self {
        if header.format.reserved_slot().is_none() {
            return ReservedSlotState::Unsupported;
        }
        if !header.is_occupied(RESERVED_SLOT) {
            return ReservedSlotState::Empty;
        }
        match header.annotation_for(RESERVED_SLOT) {
            Some(annotation) if annotation.is_hardware_key() => {
                ReservedSlotState::HardwareAnnotated
            }
            _ => ReservedSlotState::Other,
        }
    }
}

impl fmt::Display for ReservedSlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating a replace of the reserved slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyDecision {
    pub state: ReservedSlotState,
    pub proceed: bool,
    /// Short reason used when the decision aborts.
    pub reason: String,
    /// Every observation the decision was based on, in order.
    pub evidence: Vec<String>,
}

impl SafetyDecision {
    fn proceed(state: ReservedSlotState, evidence: Vec<String>) -> Self {
        Self {
            state,
            proceed: true,
            reason: String::new(),
            evidence,
        }
    }

    fn abort(state: ReservedSlotState, reason: impl Into<String>, evidence: Vec<String>) -> Self {
        Self {
            state,
            proceed: false,
            reason: reason.into(),
            evidence,
        }
    }

    /// Convert an abort into `SafetyAbort` for `device`.
    pub fn into_result(self, device: &str) -> AutoUnlockResult<Self> {
        if self.proceed {
            Ok(self)
        } else {
            Err(AutoUnlockError::SafetyAbort {
                device: device.to_string(),
                reason: self.reason,
            })
        }
    }
}

/// Whether `credential` opens `slot` on `device`.
///
/// This is the one predicate both cleanup strategies share.
pub fn credential_opens_slot<P>(
    provider: &P,
    device: &str,
    credential: &Credential,
    slot: u8,
) -> AutoUnlockResult<bool>
where
    P: LuksProvider<Error = AutoUnlockError>,
{
    provider.test_unlock(device, credential.key_material(), Some(slot))
}

/// Whether `credential` opens `device` through any slot.
pub fn credential_opens_device<P>(
    provider: &P,
    device: &str,
    credential: &Credential,
) -> AutoUnlockResult<bool>
where
    P: LuksProvider<Error = AutoUnlockError>,
{
    provider.test_unlock(device, credential.key_material(), None)
}

/// Decision procedure for the reserved slot of one device.
pub struct SafetyValidator<'a, P> {
    provider: &'a P,
    credential: &'a Credential,
}

impl<'a, P> SafetyValidator<'a, P>
where
    P: LuksProvider<Error = AutoUnlockError>,
{
    pub fn new(provider: &'a P, credential: &'a Credential) -> Self {
        Self {
            provider,
            credential,
        }
    }

    /// Fail with `CredentialInvalid` unless the credential opens the device.
    pub fn require_credential(&self, device: &str) -> AutoUnlockResult<()> {
        match credential_opens_device(self.provider, device, self.credential) {
            Ok(true) => Ok(()),
            Ok(false) => Err(AutoUnlockError::CredentialInvalid {
                device: device.to_string(),
            }),
            Err(err) => {
                warn!("credential check on {device} failed: {err}");
                Err(AutoUnlockError::CredentialInvalid {
                    device: device.to_string(),
                })
            }
        }
    }

    /// Validate a replace of the reserved slot, reading the header afresh.
    pub fn validate_replace(&self, device: &str) -> SafetyDecision {
        let mut evidence = Vec::new();

        match credential_opens_device(self.provider, device, self.credential) {
            Ok(true) => evidence.push(format!("supplied {} opens {device}", self.credential.kind())),
            Ok(false) => {
                evidence.push(format!(
                    "supplied {} does not open {device}",
                    self.credential.kind()
                ));
                return SafetyDecision::abort(
                    ReservedSlotState::Error,
                    "credential does not open device",
                    evidence,
                );
            }
            Err(err) => {
                evidence.push(format!("credential test failed: {err}"));
                return SafetyDecision::abort(
                    ReservedSlotState::Error,
                    "credential test failed",
                    evidence,
                );
            }
        }

        let header = match self.provider.read_header(device) {
            Ok(header) => header,
            Err(err) => {
                evidence.push(format!("header inspection failed: {err}"));
                return SafetyDecision::abort(
                    ReservedSlotState::Error,
                    "header inspection failed",
                    evidence,
                );
            }
        };

        self.decide(device, &header, evidence)
    }

    /// Validate a replace against a header the caller already holds.
    pub fn decide(
        &self,
        device: &str,
        header: &HeaderMetadata,
        mut evidence: Vec<String>,
    ) -> SafetyDecision {
        let state = ReservedSlotState::of(header);
        evidence.push(format!("reserved slot state: {state}"));

        match state {
            ReservedSlotState::Unsupported => SafetyDecision::abort(
                state,
                format!("{} has no reserved slot", header.format),
                evidence,
            ),
            ReservedSlotState::Empty => SafetyDecision::proceed(state, evidence),
            ReservedSlotState::HardwareAnnotated | ReservedSlotState::Other => {
                match credential_opens_slot(self.provider, device, self.credential, RESERVED_SLOT) {
                    Ok(true) => {
                        evidence.push(format!(
                            "supplied {} opens slot {RESERVED_SLOT}",
                            self.credential.kind()
                        ));
                        SafetyDecision::abort(state, "slot protected", evidence)
                    }
                    Ok(false) => {
                        evidence.push(format!(
                            "supplied {} cannot open slot {RESERVED_SLOT}; reclaimable",
                            self.credential.kind()
                        ));
                        SafetyDecision::proceed(state, evidence)
                    }
                    Err(err) => {
                        evidence.push(format!("slot {RESERVED_SLOT} test failed: {err}"));
                        SafetyDecision::abort(
                            ReservedSlotState::Error,
                            "reserved slot test failed",
                            evidence,
                        )
                    }
                }
            }
            ReservedSlotState::Error => {
                SafetyDecision::abort(state, "reserved slot could not be inspected", evidence)
            }
        }
    }
}

/// The two cleanup algorithms, selected by header format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupStrategy {
    /// Validate and reclaim slot 31, then install there. Hardware-key slots
    /// left elsewhere by older installs are scanned as in `LegacyScan`.
    ReservedSlot,
    /// Scan previously annotated slots, remove the unreachable ones, install
    /// into the first free slot. Headers without token support carry no
    /// annotations, so only slot selection applies to them.
    LegacyScan,
}

impl CleanupStrategy {
    pub fn for_format(format: HeaderFormat) -> Self {
        match format.reserved_slot() {
            Some(_) => CleanupStrategy::ReservedSlot,
            None => CleanupStrategy::LegacyScan,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CleanupStrategy::ReservedSlot => "reserved-slot",
            CleanupStrategy::LegacyScan => "legacy-scan",
        }
    }
}

/// Mutations a strategy intends to make before installing the new key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupPlan {
    pub strategy: CleanupStrategy,
    pub remove_slots: Vec<u8>,
    pub remove_tokens: Vec<u32>,
    /// Slot the new key will be installed into.
    pub install_slot: Option<u8>,
    pub evidence: Vec<String>,
}

impl CleanupPlan {
    pub fn removes_reserved_slot(&self) -> bool {
        self.remove_slots.contains(&RESERVED_SLOT)
    }
}

/// Queue removal of slots annotated as hardware keys that the credential
/// cannot open. Slot 0 and the reserved slot are never considered here.
fn scan_annotated_slots<P>(
    provider: &P,
    device: &str,
    credential: &Credential,
    header: &HeaderMetadata,
    plan: &mut CleanupPlan,
) -> AutoUnlockResult<()>
where
    P: LuksProvider<Error = AutoUnlockError>,
{
    let reserved = header.format.reserved_slot();
    for &slot in &header.occupied_slots {
        if slot == ORIGINAL_SLOT || Some(slot) == reserved {
            continue;
        }
        let annotated = header
            .annotation_for(slot)
            .is_some_and(|a| a.is_hardware_key());
        if !annotated {
            continue;
        }
        if credential_opens_slot(provider, device, credential, slot)? {
            plan.evidence
                .push(format!("slot {slot}: credential opens it; kept"));
        } else {
            plan.evidence
                .push(format!("slot {slot}: prior hardware key, unreachable; removed"));
            plan.remove_slots.push(slot);
        }
    }
    Ok(())
}

/// Work out what to remove and where to install on `device`.
///
/// Returns `SafetyAbort` when the reserved slot is protected or when no slot
/// is left to install into.
pub fn plan_cleanup<P>(
    provider: &P,
    device: &str,
    credential: &Credential,
    header: &HeaderMetadata,
) -> AutoUnlockResult<CleanupPlan>
where
    P: LuksProvider<Error = AutoUnlockError>,
{
    let strategy = CleanupStrategy::for_format(header.format);
    let mut plan = CleanupPlan {
        strategy,
        remove_slots: Vec::new(),
        remove_tokens: Vec::new(),
        install_slot: None,
        evidence: vec![format!("{} header, {} strategy", header.format, strategy.as_str())],
    };

    match strategy {
        CleanupStrategy::ReservedSlot => {
            let validator = SafetyValidator::new(provider, credential);
            let decision = validator.decide(device, header, Vec::new());
            plan.evidence.extend(decision.evidence.iter().cloned());
            let decision = decision.into_result(device)?;
            if decision.state != ReservedSlotState::Empty {
                plan.remove_slots.push(RESERVED_SLOT);
            }
            scan_annotated_slots(provider, device, credential, header, &mut plan)?;
            plan.install_slot = Some(RESERVED_SLOT);
        }
        CleanupStrategy::LegacyScan => {
            scan_annotated_slots(provider, device, credential, header, &mut plan)?;
            plan.install_slot = (1..header.format.slot_count())
                .find(|slot| !header.is_occupied(*slot) || plan.remove_slots.contains(slot));
        }
    }

    for annotation in &header.annotations {
        let Some(token_id) = annotation.token_id else {
            continue;
        };
        if !annotation.is_hardware_key() {
            continue;
        }
        let orphaned = !annotation.keyslots.iter().any(|slot| header.is_occupied(*slot));
        let follows_removed = annotation
            .keyslots
            .iter()
            .any(|slot| plan.remove_slots.contains(slot));
        if orphaned || follows_removed {
            plan.remove_tokens.push(token_id);
        }
    }

    if plan.install_slot.is_none() {
        return Err(AutoUnlockError::SafetyAbort {
            device: device.to_string(),
            reason: "no free key slot available".into(),
        });
    }

    for line in &plan.evidence {
        info!("{device}: {line}");
    }
    Ok(plan)
}
