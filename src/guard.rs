use crate::prelude::*;

use std::sync::{Arc, Mutex};

/// Coarse activities that must not overlap: bus traffic, probing, scans and
/// firmware updates all contend for the same radio/bus time slices.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Activity {
    TcpRequestHandling,
    SerialIo,
    LinkProbe,
    NetworkScan,
    FirmwareUpdate,
}

impl Activity {
    pub fn name(&self) -> &'static str {
        match self {
            Activity::TcpRequestHandling => "TCP",
            Activity::SerialIo => "RS485",
            Activity::LinkProbe => "PROBE",
            Activity::NetworkScan => "SCAN",
            Activity::FirmwareUpdate => "UPDATE",
        }
    }
}

#[derive(Debug)]
struct GuardState {
    active: Option<(Activity, &'static str)>,
}

/// Advisory mutual-exclusion token with at most one owner at a time.
/// Consulted at the entry points of mutually destructive activities; it does
/// not intercept raw bus I/O.
#[derive(Clone)]
pub struct GuardManager {
    state: Arc<Mutex<GuardState>>,
}

impl Default for GuardManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GuardState { active: None })),
        }
    }

    /// Non-blocking acquire. `None` means another activity owns the guard.
    pub fn try_acquire(&self, activity: Activity, reason: &'static str) -> Option<OperationGuard> {
        let mut state = self.state.lock().unwrap();
        if state.active.is_some() {
            return None;
        }

        state.active = Some((activity, reason));
        debug!("guard acquired: {} ({})", activity.name(), reason);

        Some(OperationGuard {
            state: self.state.clone(),
            activity,
        })
    }

    pub fn active_kind(&self) -> Option<Activity> {
        self.state.lock().unwrap().active.map(|(a, _)| a)
    }

    pub fn active_reason(&self) -> Option<&'static str> {
        self.state.lock().unwrap().active.map(|(_, r)| r)
    }
}

/// Scoped ownership of the guard; released on drop.
pub struct OperationGuard {
    state: Arc<Mutex<GuardState>>,
    activity: Activity,
}

impl OperationGuard {
    pub fn activity(&self) -> Activity {
        self.activity
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        debug!("guard released: {}", self.activity.name());
        state.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_on_drop() {
        let manager = GuardManager::new();
        assert_eq!(manager.active_kind(), None);

        {
            let guard = manager.try_acquire(Activity::SerialIo, "bus transaction").unwrap();
            assert_eq!(guard.activity(), Activity::SerialIo);
            assert_eq!(manager.active_kind(), Some(Activity::SerialIo));
            assert_eq!(manager.active_reason(), Some("bus transaction"));
        }

        assert_eq!(manager.active_kind(), None);
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let manager = GuardManager::new();
        let _guard = manager.try_acquire(Activity::NetworkScan, "roam check").unwrap();

        assert!(manager.try_acquire(Activity::TcpRequestHandling, "client request").is_none());
        assert!(manager.try_acquire(Activity::NetworkScan, "another scan").is_none());
    }
}
