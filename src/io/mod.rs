//! Port-mapped I/O bus.
//!
//! Devices implement [`PortDevice`] and register for a set of port numbers.
//! `IN`/`OUT` dispatch through here; unbound ports read as zero and swallow
//! writes. Devices run synchronously on the executing instruction's thread
//! and must not re-enter the CPU.

use std::collections::HashMap;

/// A device reachable through `IN`/`OUT`.
pub trait PortDevice {
    /// Handle a port read of `size` bytes (1, 2 or 4). The result is
    /// truncated to the access size by the bus.
    fn port_in(&mut self, port: u16, size: u8) -> u64;

    /// Handle a port write of `size` bytes (1, 2 or 4).
    fn port_out(&mut self, port: u16, value: u64, size: u8);
}

/// Maps port numbers to registered devices.
#[derive(Default)]
pub struct IoBus {
    devices: Vec<Box<dyn PortDevice>>,
    ports: HashMap<u16, usize>,
}

impl IoBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `device` to every port in `ports`. Later registrations win on
    /// overlap.
    pub fn register(&mut self, ports: &[u16], device: Box<dyn PortDevice>) {
        let index = self.devices.len();
        self.devices.push(device);
        for &port in ports {
            if self.ports.insert(port, index).is_some() {
                log::warn!("port 0x{:04X} rebound to a new device", port);
            }
        }
    }

    /// Dispatch a port read. Unbound ports read as 0.
    pub fn port_in(&mut self, port: u16, size: u8) -> u64 {
        match self.ports.get(&port) {
            Some(&index) => {
                let value = self.devices[index].port_in(port, size) & size_mask(size);
                log::trace!("in 0x{:04X} ({} bytes) -> 0x{:X}", port, size, value);
                value
            }
            None => {
                log::trace!("in 0x{:04X} ({} bytes): unbound, reading 0", port, size);
                0
            }
        }
    }

    /// Dispatch a port write. Unbound ports drop the value.
    pub fn port_out(&mut self, port: u16, value: u64, size: u8) {
        match self.ports.get(&port) {
            Some(&index) => {
                log::trace!("out 0x{:04X} ({} bytes) <- 0x{:X}", port, size, value);
                self.devices[index].port_out(port, value & size_mask(size), size);
            }
            None => {
                log::trace!(
                    "out 0x{:04X} ({} bytes) <- 0x{:X}: unbound, dropped",
                    port,
                    size,
                    value
                );
            }
        }
    }
}

#[inline]
fn size_mask(size: u8) -> u64 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}
