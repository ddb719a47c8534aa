/*!
    runtime settings of the master

    Every bounded wait and retry count of the stack is a field of [MasterConfig], so they can be calibrated to the target hardware without recompiling. Durations are stored as integers in the unit suffixing their field name, which keeps the YAML files readable.

    ```yaml
    cycle_period_us: 1000
    target_state: Operational
    slaves:
      - position: 0
        vendor: 0x2
        name: coupler
    ```
*/

use core::time::Duration;
use std::{error::Error, fs, path::Path};
use serde::{Deserialize, Serialize};
use crate::registers::AlState;


#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// period of the process data cycle
    pub cycle_period_us: u64,
    /// maximum time waited for a frame to come back from the segment
    pub response_timeout_us: u64,
    /// number of retries of a probe before the scan fails at that position
    pub scan_retries: usize,
    /// the scan stops after this many slaves
    pub max_slaves: u16,
    /// maximum time waited for a slave to confirm an AL state
    pub al_timeout_ms: u64,
    /// delay between two reads of the AL status while waiting for a transition
    pub al_poll_us: u64,
    /// number of retries of the AL control write
    pub al_write_retries: usize,
    /// maximum time waited for the EEPROM interface of a slave
    pub sii_timeout_ms: u64,
    /// maximum time waited for a mailbox response before the request is sent again
    pub mailbox_timeout_ms: u64,
    /// number of times a mailbox request is sent again before [crate::EthercatError::SdoTimeout]
    pub mailbox_retries: usize,
    /// consecutive failed cycles of a slave after which it is demoted to SAFEOP
    pub cycle_failures_before_demote: usize,
    /// consecutive lost frames after which the medium is considered lost
    pub lost_frames_before_medium_lost: usize,
    /// first logical address of the process image
    pub logical_start: u32,
    /// state reached by all slaves at the end of the bring-up
    pub target_state: AlState,
    /// realtime priority of the thread running the cycle, from 1 to 99
    pub thread_priority: Option<u8>,
    /// settings of particular slaves
    pub slaves: Vec<SlaveConfig>,
}

/// expectations and overrides for the slave at a given position on the segment
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveConfig {
    pub position: u16,
    /// expected vendor id, checked against the EEPROM
    pub vendor: Option<u32>,
    /// expected product code, checked against the EEPROM
    pub product: Option<u32>,
    /// name replacing the one read from the EEPROM
    pub name: Option<String>,
    /// byte size of outputs to map instead of the declared one
    pub outputs: Option<u16>,
    /// byte size of inputs to map instead of the declared one
    pub inputs: Option<u16>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            cycle_period_us: 1000,
            response_timeout_us: 2000,
            scan_retries: 3,
            max_slaves: 256,
            al_timeout_ms: 1000,
            al_poll_us: 500,
            al_write_retries: 3,
            sii_timeout_ms: 100,
            mailbox_timeout_ms: 100,
            mailbox_retries: 3,
            cycle_failures_before_demote: 3,
            lost_frames_before_medium_lost: 20,
            logical_start: 0x0001_0000,
            target_state: AlState::Operational,
            thread_priority: None,
            slaves: Vec::new(),
        }
    }
}

impl MasterConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, Box<dyn Error>> {
        let text = fs::read_to_string(path)?;
        Ok(Self::from_yaml_str(&text)?)
    }
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn cycle_period(&self) -> Duration  {Duration::from_micros(self.cycle_period_us)}
    pub fn response_timeout(&self) -> Duration  {Duration::from_micros(self.response_timeout_us)}
    pub fn al_timeout(&self) -> Duration  {Duration::from_millis(self.al_timeout_ms)}
    pub fn al_poll(&self) -> Duration  {Duration::from_micros(self.al_poll_us)}
    pub fn sii_timeout(&self) -> Duration  {Duration::from_millis(self.sii_timeout_ms)}
    pub fn mailbox_timeout(&self) -> Duration  {Duration::from_millis(self.mailbox_timeout_ms)}

    /// settings of the slave at the given position, if any
    pub fn slave(&self, position: u16) -> Option<&SlaveConfig> {
        self.slaves.iter().find(|slave| slave.position == position)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml() {
        let config = MasterConfig::from_yaml_str(concat!(
            "cycle_period_us: 250\n",
            "target_state: SafeOperational\n",
            "slaves:\n",
            "  - position: 1\n",
            "    vendor: 0x2\n",
            "    outputs: 4\n",
            )).unwrap();
        assert_eq!(config.cycle_period(), Duration::from_micros(250));
        assert_eq!(config.target_state, AlState::SafeOperational);
        assert_eq!(config.scan_retries, MasterConfig::default().scan_retries);

        let slave = config.slave(1).unwrap();
        assert_eq!(slave.vendor, Some(2));
        assert_eq!(slave.outputs, Some(4));
        assert_eq!(slave.inputs, None);
        assert!(config.slave(0).is_none());
    }

    #[test]
    fn yaml_file() {
        let path = std::env::temp_dir().join(format!("ecmaster-config-{}.yaml", std::process::id()));
        let config = MasterConfig {mailbox_retries: 7, .. Default::default()};
        fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();
        assert_eq!(MasterConfig::from_yaml(&path).unwrap(), config);
        fs::remove_file(&path).unwrap();

        assert!(MasterConfig::from_yaml("/nonexistent/ecmaster.yaml").is_err());
    }
}
