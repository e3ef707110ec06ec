//! Class driver registration and the USB driver switch.
//!
//! [`UvcClassDriver`] is the object handed to the platform's driver manager;
//! it routes controller callbacks into the [`ControlStateMachine`].
//! [`DriverSwitch`] takes the bus away from the stock class drivers when
//! streaming starts and gives it back at shutdown.

use std::sync::Arc;

use tracing::{debug, info, warn};
use udcd_uvc_protocol::{
    SetupPacket, UsbSpeed, configuration_with_iad, device_descriptor, string_descriptor,
};

use crate::config::GadgetConfig;
use crate::control::{ControlOutcome, ControlStateMachine};
use crate::error::{DriverStatus, GadgetError, GadgetResult};
use crate::session::Session;

/// Product string advertised by the gadget.
pub const PRODUCT_STRING: &str = "PSVita";
/// Serial number string advertised by the gadget.
pub const SERIAL_STRING: &str = "UDCD UVC";

/// Callbacks the driver manager invokes on a registered class driver.
pub trait ClassDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Handle an EP0 setup packet. A negative `arg` marks a request the
    /// manager does not want handled.
    fn process_request(&self, setup: &SetupPacket, arg: i32) -> ControlOutcome;

    fn change_setting(&self, interface: u8, alternate: u8);

    /// The device was attached to a host.
    fn attach(&self, speed: UsbSpeed);

    /// The device was detached from the host.
    fn detach(&self);

    fn configure(&self, speed: UsbSpeed);
}

/// Descriptor bytes registered alongside a class driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverDescriptors {
    pub device: Vec<u8>,
    pub configuration_high_speed: Vec<u8>,
    pub configuration_full_speed: Vec<u8>,
    pub product: Vec<u8>,
    pub serial: Vec<u8>,
}

impl DriverDescriptors {
    /// Build the descriptor set, with the interface association grafted into
    /// both configurations.
    ///
    /// # Errors
    ///
    /// Propagates descriptor splice failures.
    pub fn build() -> GadgetResult<Self> {
        Ok(Self {
            // Vendor and product IDs are supplied by the manager on activation.
            device: device_descriptor(0, 0),
            configuration_high_speed: configuration_with_iad(UsbSpeed::High)?,
            configuration_full_speed: configuration_with_iad(UsbSpeed::Full)?,
            product: string_descriptor(PRODUCT_STRING),
            serial: string_descriptor(SERIAL_STRING),
        })
    }

    pub fn configuration(&self, speed: UsbSpeed) -> &[u8] {
        match speed {
            UsbSpeed::High => &self.configuration_high_speed,
            UsbSpeed::Full => &self.configuration_full_speed,
        }
    }
}

/// Platform USB driver manager.
pub trait UdcDriverManager: Send + Sync {
    fn register(
        &self,
        driver: Arc<dyn ClassDriver>,
        descriptors: DriverDescriptors,
    ) -> Result<(), DriverStatus>;

    fn unregister(&self, name: &str) -> Result<(), DriverStatus>;

    fn start(&self, name: &str) -> Result<(), DriverStatus>;

    fn stop(&self, name: &str) -> Result<(), DriverStatus>;

    /// Present the device to the host under `product_id`.
    fn activate(&self, product_id: u16) -> Result<(), DriverStatus>;

    /// Withdraw the device from the host.
    fn deactivate(&self) -> Result<(), DriverStatus>;
}

/// The UVC class driver.
#[derive(Debug, Clone)]
pub struct UvcClassDriver {
    name: String,
    control: ControlStateMachine,
}

impl UvcClassDriver {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            name: session.config().driver_name.clone(),
            control: ControlStateMachine::new(session),
        }
    }

    pub fn control(&self) -> &ControlStateMachine {
        &self.control
    }
}

impl ClassDriver for UvcClassDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_request(&self, setup: &SetupPacket, arg: i32) -> ControlOutcome {
        if arg < 0 {
            return ControlOutcome::Ignored;
        }
        self.control.handle_request(setup)
    }

    fn change_setting(&self, interface: u8, alternate: u8) {
        debug!(interface, alternate, "change setting");
    }

    fn attach(&self, speed: UsbSpeed) {
        info!(?speed, "attached");
        let session = self.control.session();
        if let Err(e) = session.transport().clear_fifo(session.video_endpoint()) {
            warn!(error = %e, "failed to clear video FIFO on attach");
        }
    }

    fn detach(&self) {
        info!("detached");
        self.control.session().video_abort();
    }

    fn configure(&self, speed: UsbSpeed) {
        debug!(?speed, "configured");
    }
}

/// Moves the bus between the stock class drivers and the UVC driver.
pub struct DriverSwitch {
    manager: Arc<dyn UdcDriverManager>,
    config: GadgetConfig,
}

impl std::fmt::Debug for DriverSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSwitch")
            .field("driver", &self.config.driver_name)
            .finish_non_exhaustive()
    }
}

impl DriverSwitch {
    pub fn new(manager: Arc<dyn UdcDriverManager>, config: GadgetConfig) -> Self {
        Self { manager, config }
    }

    /// Stop the competing drivers, restart the controller, start the UVC
    /// driver and activate its product ID.
    ///
    /// A failing step undoes the steps before it.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::Driver`] naming the step that failed.
    pub fn activate_uvc(&self) -> GadgetResult<()> {
        let cfg = &self.config;
        info!(driver = %cfg.driver_name, pid = cfg.product_id, "switching to UVC driver");

        match self.manager.deactivate() {
            Ok(()) => {}
            Err(DriverStatus::NotActive) => debug!("device was not active"),
            Err(status) => return Err(GadgetError::driver("udcd", "deactivate", status)),
        }

        for name in &cfg.competing_drivers {
            self.stop_quietly(name);
        }
        self.stop_quietly(&cfg.controller_driver);

        self.manager
            .start(&cfg.controller_driver)
            .map_err(|status| {
                GadgetError::driver(cfg.controller_driver.as_str(), "start", status)
            })?;

        if let Err(status) = self.manager.start(&cfg.driver_name) {
            self.stop_quietly(&cfg.controller_driver);
            return Err(GadgetError::driver(cfg.driver_name.as_str(), "start", status));
        }

        if let Err(status) = self.manager.activate(cfg.product_id) {
            self.stop_quietly(&cfg.driver_name);
            self.stop_quietly(&cfg.controller_driver);
            return Err(GadgetError::driver(
                format!("{:#06x}", cfg.product_id),
                "activate",
                status,
            ));
        }

        info!("UVC driver active");
        Ok(())
    }

    /// Reverse [`DriverSwitch::activate_uvc`] and bring the stock class
    /// driver back. Every step is attempted; failures are logged.
    pub fn restore_default(&self) {
        let cfg = &self.config;
        info!(driver = %cfg.restore_driver, pid = cfg.restore_product_id, "restoring default driver");

        if let Err(status) = self.manager.deactivate() {
            debug!(%status, "deactivate during restore");
        }
        self.stop_quietly(&cfg.driver_name);
        self.stop_quietly(&cfg.controller_driver);
        if let Err(status) = self.manager.start(&cfg.controller_driver) {
            warn!(driver = %cfg.controller_driver, %status, "failed to restart controller driver");
        }
        if let Err(status) = self.manager.start(&cfg.restore_driver) {
            warn!(driver = %cfg.restore_driver, %status, "failed to restart default driver");
        }
        if let Err(status) = self.manager.activate(cfg.restore_product_id) {
            warn!(pid = cfg.restore_product_id, %status, "failed to reactivate default product");
        }
    }

    /// Deactivate and stop the UVC and controller drivers, leaving the bus idle.
    pub fn release(&self) {
        let cfg = &self.config;
        if let Err(status) = self.manager.deactivate() {
            debug!(%status, "deactivate during release");
        }
        self.stop_quietly(&cfg.driver_name);
        self.stop_quietly(&cfg.controller_driver);
    }

    fn stop_quietly(&self, name: &str) {
        if let Err(status) = self.manager.stop(name) {
            debug!(driver = name, %status, "stop failed");
        }
    }
}
