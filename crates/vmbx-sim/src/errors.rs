//! Error injection for simulated devices.
//!
//! Operations are named by string (`"open_camera"`, `"AcquisitionStart"`,
//! `"start_streaming"`, ...). Each call to [`ErrorConfig::check`] either
//! passes or yields the [`VmbError::Device`] the scenario dictates.

use crate::rng::SimRng;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use vmbx_core::{DeviceFaultKind, VmbError};

/// A failure pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// Succeed `count` times, then fail every call.
    FailAfterN {
        /// Operation name.
        operation: &'static str,
        /// Successful calls before the first failure.
        count: u32,
    },
    /// Always time out.
    Timeout {
        /// Operation name.
        operation: &'static str,
    },
    /// First checked call drops the link; every later call fails too.
    CommunicationLoss,
    /// First checked call latches a hardware fault code.
    HardwareFault {
        /// Fault code reported in the message.
        code: u32,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    communication_lost: bool,
    hardware_fault_code: u32,
}

/// Failure configuration of one simulated device.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    failure_rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<SimRng>,
    state: Arc<Mutex<ErrorState>>,
}

impl ErrorConfig {
    /// Never fail.
    #[must_use]
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Fail any operation with probability `rate`, reproducibly for a given seed.
    #[must_use]
    pub fn random_failures(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// One scenario.
    #[must_use]
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios, checked in order.
    #[must_use]
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(SimRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Decide whether `operation` on `module` fails this time.
    pub fn check(&self, module: &str, operation: &'static str) -> Result<(), VmbError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(VmbError::device(
                module,
                DeviceFaultKind::Communication,
                "Communication lost",
            ));
        }
        if state.hardware_fault_code != 0 {
            return Err(VmbError::device(
                module,
                DeviceFaultKind::Hardware,
                format!("Hardware fault: {}", state.hardware_fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN { operation: op, count } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(VmbError::device(
                            module,
                            DeviceFaultKind::Hardware,
                            format!("Injected failure on '{}' after {} calls", operation, count),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(VmbError::device(
                        module,
                        DeviceFaultKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(VmbError::device(
                        module,
                        DeviceFaultKind::Communication,
                        "Communication lost",
                    ));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    return Err(VmbError::device(
                        module,
                        DeviceFaultKind::Hardware,
                        format!("Hardware fault: {}", code),
                    ));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.chance(rate) {
            return Err(VmbError::device(
                module,
                DeviceFaultKind::Hardware,
                format!("Random failure on '{}'", operation),
            ));
        }
        Ok(())
    }

    /// Clear counters and latched faults.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
