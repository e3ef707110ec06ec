//! Gadget configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use udcd_uvc_protocol::{
    CONTROL_INTERFACE, ControlVersion, HeaderFormat, STREAM_INTERFACE, VIDEO_ENDPOINT_ADDRESS,
};

use crate::error::{GadgetError, GadgetResult};

/// Name the class driver registers under.
pub const DEFAULT_DRIVER_NAME: &str = "VITAUVC00";
/// USB product ID presented while the UVC driver is active.
pub const DEFAULT_UVC_PRODUCT_ID: u16 = 0x1337;
/// Product ID of the stock class driver restored at shutdown.
pub const DEFAULT_RESTORE_PRODUCT_ID: u16 = 0x04E4;
/// Controller driver restarted around the switch.
pub const DEFAULT_CONTROLLER_DRIVER: &str = "USBDeviceControllerDriver";
/// Stock class driver restored at shutdown.
pub const DEFAULT_RESTORE_DRIVER: &str = "USB_MTP_Driver";

/// Class drivers stopped before the UVC driver takes the bus.
pub const DEFAULT_COMPETING_DRIVERS: [&str; 3] =
    ["USB_MTP_Driver", "USBPSPCommunicationDriver", "USBSerDriver"];

/// Runtime configuration for a [`crate::UvcGadget`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GadgetConfig {
    /// Class driver name.
    pub driver_name: String,
    /// Product ID activated for the UVC driver.
    pub product_id: u16,
    /// Product ID activated when the stock driver is restored.
    pub restore_product_id: u16,
    /// Device controller driver name.
    pub controller_driver: String,
    /// Class drivers stopped before activation.
    pub competing_drivers: Vec<String>,
    /// Class driver started again at shutdown.
    pub restore_driver: String,

    /// Payload header layout.
    pub header_format: HeaderFormat,
    /// Probe/commit control block revision.
    pub control_version: ControlVersion,
    /// Bulk endpoint max packet size in bytes.
    pub max_packet_size: u16,
    /// Bytes per payload transfer, header included.
    pub max_payload_transfer_size: u32,

    /// Video control interface number.
    pub control_interface: u8,
    /// Video streaming interface number.
    pub stream_interface: u8,
    /// Bulk IN endpoint number (without the direction bit).
    pub video_endpoint: u8,

    /// Upper bound on a single chain completion wait, in milliseconds.
    pub completion_timeout_ms: u64,
    /// How often a blocked submit re-checks the stream state, in milliseconds.
    pub completion_poll_ms: u64,
    /// Frame buffer is released after this long without a frame signal, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Display refresh rate driving vblank pacing.
    pub vblank_rate_hz: u32,
    /// Delay between the first framebuffer and the driver switch, in milliseconds.
    pub startup_delay_ms: u64,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            product_id: DEFAULT_UVC_PRODUCT_ID,
            restore_product_id: DEFAULT_RESTORE_PRODUCT_ID,
            controller_driver: DEFAULT_CONTROLLER_DRIVER.to_string(),
            competing_drivers: DEFAULT_COMPETING_DRIVERS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            restore_driver: DEFAULT_RESTORE_DRIVER.to_string(),
            header_format: HeaderFormat::Compact,
            control_version: ControlVersion::V1_1,
            max_packet_size: 512,
            max_payload_transfer_size: 16 * 1024,
            control_interface: CONTROL_INTERFACE,
            stream_interface: STREAM_INTERFACE,
            video_endpoint: VIDEO_ENDPOINT_ADDRESS & 0x0F,
            completion_timeout_ms: 1000,
            completion_poll_ms: 20,
            idle_timeout_ms: 1000,
            vblank_rate_hz: 60,
            startup_delay_ms: 5000,
        }
    }
}

impl GadgetConfig {
    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> GadgetConfigBuilder {
        GadgetConfigBuilder::default()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::InvalidConfiguration`] naming the first invalid field.
    pub fn validate(&self) -> GadgetResult<()> {
        if self.driver_name.is_empty() {
            return Err(GadgetError::invalid_configuration(
                "driver_name must not be empty",
            ));
        }
        if self.controller_driver.is_empty() {
            return Err(GadgetError::invalid_configuration(
                "controller_driver must not be empty",
            ));
        }
        let header_len = self.header_format.len();
        if usize::from(self.max_packet_size) <= header_len {
            return Err(GadgetError::invalid_configuration(format!(
                "max_packet_size must exceed the {header_len}-byte payload header"
            )));
        }
        if self.max_payload_transfer_size < u32::from(self.max_packet_size) {
            return Err(GadgetError::invalid_configuration(
                "max_payload_transfer_size must be at least max_packet_size",
            ));
        }
        if !(1..=15).contains(&self.video_endpoint) {
            return Err(GadgetError::invalid_configuration(
                "video_endpoint must be between 1 and 15",
            ));
        }
        if self.control_interface == self.stream_interface {
            return Err(GadgetError::invalid_configuration(
                "control_interface and stream_interface must differ",
            ));
        }
        if self.completion_poll_ms == 0 || self.completion_poll_ms > self.completion_timeout_ms {
            return Err(GadgetError::invalid_configuration(
                "completion_poll_ms must be non-zero and at most completion_timeout_ms",
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(GadgetError::invalid_configuration(
                "idle_timeout_ms must be non-zero",
            ));
        }
        if self.vblank_rate_hz == 0 {
            return Err(GadgetError::invalid_configuration(
                "vblank_rate_hz must be non-zero",
            ));
        }
        Ok(())
    }

    /// Segments needed to carry one full payload transfer.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        let max_payload = self.max_payload_transfer_size as usize;
        max_payload.div_ceil(usize::from(self.max_packet_size.max(1)))
    }

    #[must_use]
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    #[must_use]
    pub fn completion_poll(&self) -> Duration {
        Duration::from_millis(self.completion_poll_ms)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    #[must_use]
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

/// Builder for [`GadgetConfig`].
#[derive(Debug, Default)]
pub struct GadgetConfigBuilder {
    config: GadgetConfig,
}

impl GadgetConfigBuilder {
    /// Set the class driver name.
    #[must_use]
    pub fn driver_name(mut self, name: impl Into<String>) -> Self {
        self.config.driver_name = name.into();
        self
    }

    /// Set the UVC product ID.
    #[must_use]
    pub fn product_id(mut self, pid: u16) -> Self {
        self.config.product_id = pid;
        self
    }

    /// Set the class drivers stopped before activation.
    #[must_use]
    pub fn competing_drivers<I, S>(mut self, drivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.competing_drivers = drivers.into_iter().map(Into::into).collect();
        self
    }

    /// Set the payload header layout.
    #[must_use]
    pub fn header_format(mut self, format: HeaderFormat) -> Self {
        self.config.header_format = format;
        self
    }

    /// Set the control block revision.
    #[must_use]
    pub fn control_version(mut self, version: ControlVersion) -> Self {
        self.config.control_version = version;
        self
    }

    /// Set the bulk max packet size.
    #[must_use]
    pub fn max_packet_size(mut self, size: u16) -> Self {
        self.config.max_packet_size = size;
        self
    }

    /// Set the payload transfer size.
    #[must_use]
    pub fn max_payload_transfer_size(mut self, size: u32) -> Self {
        self.config.max_payload_transfer_size = size;
        self
    }

    /// Set the completion wait bound and poll interval.
    #[must_use]
    pub fn completion_wait(mut self, timeout: Duration, poll: Duration) -> Self {
        self.config.completion_timeout_ms = duration_ms(timeout);
        self.config.completion_poll_ms = duration_ms(poll);
        self
    }

    /// Set the idle frame buffer reclaim timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the display refresh rate.
    #[must_use]
    pub fn vblank_rate_hz(mut self, hz: u32) -> Self {
        self.config.vblank_rate_hz = hz;
        self
    }

    /// Set the start-up delay.
    #[must_use]
    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.config.startup_delay_ms = duration_ms(delay);
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> GadgetResult<GadgetConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
