// ABOUTME: Modem operations proxied through the PBX CLI: AT-command SMS listing and deletion, device state
// ABOUTME: Device IDs are validated before they are placed into CLI command text

use crate::client::default::DefaultClient;
use crate::client::error::{AmiError, AmiResult};
use crate::client::types::DongleStatus;
use crate::sim::{self, SmsInfo};
use tracing::{debug, info, warn};

/// Device IDs are interpolated into CLI text, so only ASCII alphanumerics,
/// `-` and `_` are accepted.
pub fn validate_device_id(device: &str) -> AmiResult<()> {
    let valid = !device.is_empty()
        && device
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(AmiError::InvalidData(format!("invalid device ID {:?}", device)))
    }
}

impl DefaultClient {
    /// Send an AT command to a modem through the channel driver's CLI.
    async fn at_command(
        &self,
        device: &str,
        command: &str,
        timeout: std::time::Duration,
    ) -> AmiResult<String> {
        validate_device_id(device)?;
        let cli = format!("{} cmd {} {}", self.config().dongle_command_prefix, device, command);
        self.send_command(&cli, timeout).await
    }

    /// Put the modem in SMS text mode.
    async fn text_mode(&self, device: &str) -> AmiResult<()> {
        self.at_command(device, "AT+CMGF=1", self.config().command_timeout())
            .await?;
        Ok(())
    }

    /// Every message stored on the device's SIM.
    pub async fn list_sms(&self, device: &str) -> AmiResult<Vec<SmsInfo>> {
        self.text_mode(device).await?;
        let output = self
            .at_command(device, "AT+CMGL=\"ALL\"", self.config().list_timeout())
            .await?;
        let messages = sim::parse_cmgl(&output);
        debug!("Listed {} SMS on {}", messages.len(), device);
        Ok(messages)
    }

    /// Delete the message in SIM slot `index`.
    pub async fn delete_sms(&self, device: &str, index: u32) -> AmiResult<()> {
        if index == 0 {
            return Err(AmiError::InvalidData("SIM index is 1-based".to_string()));
        }
        self.text_mode(device).await?;
        self.at_command(
            device,
            &format!("AT+CMGD={}", index),
            self.config().command_timeout(),
        )
        .await?;
        info!("Deleted SMS at index {} on {}", index, device);
        Ok(())
    }

    /// Delete every message on the SIM.
    pub async fn delete_all_sms(&self, device: &str) -> AmiResult<()> {
        self.text_mode(device).await?;
        self.at_command(device, "AT+CMGD=1,4", self.config().command_timeout())
            .await?;
        info!("Deleted all SMS on {}", device);
        Ok(())
    }

    /// Locate a message on the SIM by sender, approximate timestamp and
    /// content, and delete it.
    ///
    /// Returns `Ok(None)` when nothing matches; the message may already be
    /// gone.
    pub async fn find_and_delete_sms(
        &self,
        device: &str,
        sender: &str,
        timestamp: &str,
        content: &str,
    ) -> AmiResult<Option<u32>> {
        let messages = self.list_sms(device).await?;
        let tolerance = self.config().sms_match_tolerance();
        let Some(index) = sim::match_sms(sender, timestamp, content, &messages, tolerance) else {
            debug!("No SIM copy of SMS from {} found on {}", sender, device);
            return Ok(None);
        };
        self.delete_sms(device, index).await?;
        Ok(Some(index))
    }

    /// Driver-reported state of one modem. Empty output means the device is
    /// unknown to the driver and is reported offline.
    pub async fn device_state(&self, device: &str) -> AmiResult<DongleStatus> {
        validate_device_id(device)?;
        let cli = format!(
            "{} show device state {}",
            self.config().dongle_command_prefix,
            device
        );
        let output = self.send_command(&cli, self.config().command_timeout()).await?;
        Ok(parse_device_state(device, &output))
    }
}

/// Parse `show device state` output:
///
/// ```text
/// -------------- Status -------------
///   Device                  : quectel0
///   State                   : Free
///   Signal                  : 23
///   IMEI                    : 861234567890123
///   IMSI                    : 460001234567890
///   Provider Name           : CHINA MOBILE
/// ```
pub fn parse_device_state(device: &str, output: &str) -> DongleStatus {
    if output.trim().is_empty() {
        return DongleStatus::offline(device);
    }

    let mut status = DongleStatus {
        device: device.to_string(),
        state: "online".to_string(),
        ..Default::default()
    };

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "state" => status.state = value.to_string(),
            "imei" => status.imei = Some(value.to_string()),
            "imsi" => status.imsi = Some(value.to_string()),
            "provider name" | "operator" => status.operator = Some(value.to_string()),
            "signal" | "signal strength" | "rssi" => {
                // Some drivers append a description: `23 (-67 dBm)`.
                let number = value.split_whitespace().next().unwrap_or(value);
                match number.parse() {
                    Ok(signal) => status.signal = Some(signal),
                    Err(_) => warn!("Unparseable signal {:?} for {}", value, device),
                }
            }
            _ => {}
        }
    }
    status
}
