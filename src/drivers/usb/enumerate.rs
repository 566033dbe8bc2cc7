//! Device enumeration and standard requests
//!
//! A freshly reset port holds a device at address 0. Enumeration learns the
//! endpoint 0 packet size, moves the device to its own address, reads its
//! descriptors and strings, and configures it if it is a bulk-only mass
//! storage device.

use zerocopy::FromBytes;

use super::controller::{
    class, desc_type, feature, parse_configuration, req_type, request, ConfigurationDescriptor,
    DeviceDescriptor, EndpointInfo, Result, SetupPacket, UsbError, UsbSpeed,
};
use super::host::{HostController, UsbDisk};
use super::port::Device;

/// Largest configuration descriptor set read from a device
const MAX_CONFIG_SIZE: usize = 256;

impl HostController {
    /// Enumerate the device behind an enabled root port and store it there
    pub(crate) fn setup_device(&mut self, port: usize, speed: UsbSpeed) -> Result<()> {
        let address = self.alloc_address()?;
        let mut dev = Device::new(speed);

        if let Err(e) = self.enumerate(&mut dev, address) {
            self.free_address(address);
            return Err(e);
        }

        log::info!(
            "{}: port {}: {:04x}:{:04x} \"{}\" at address {}",
            self.name(),
            port + 1,
            { dev.descriptor.vendor_id },
            { dev.descriptor.product_id },
            dev.product,
            dev.address
        );

        let bulk = dev
            .config
            .mass_storage_interface()
            .and_then(|iface| Some((*iface.find_bulk_in()?, *iface.find_bulk_out()?)));

        let Some((bulk_in, bulk_out)) = bulk else {
            if dev.descriptor.device_class == class::HUB {
                log::warn!("{}: port {}: external hubs are not supported", self.name(), port + 1);
            } else if dev.is_mass_storage() {
                log::warn!("{}: port {}: mass storage interface without bulk endpoints", self.name(), port + 1);
            }
            log::info!("{}: port {}: not a mass storage device, left unconfigured", self.name(), port + 1);
            self.ports[port].device = Some(dev);
            return Ok(());
        };

        let value = dev.config.configuration_value;
        if let Err(e) = self.set_configuration(&mut dev, value) {
            log::warn!("{}: port {}: SET_CONFIGURATION({}) failed: {}", self.name(), port + 1, value, e);
            self.free_address(dev.address);
            return Err(e);
        }
        dev.bulk_in = Some(bulk_in);
        dev.bulk_out = Some(bulk_out);

        let disk = UsbDisk::new(self, port as u8, &dev, bulk_in, bulk_out);
        self.ports[port].device = Some(dev);
        let id = self.manager.attach_disk(disk);
        if id.is_none() {
            log::warn!("{}: port {}: device manager rejected the disk", self.name(), port + 1);
        }
        self.ports[port].disk = id;
        Ok(())
    }

    fn enumerate(&mut self, dev: &mut Device, address: u8) -> Result<()> {
        // The first 8 bytes carry bMaxPacketSize0
        let mut head = [0u8; 8];
        self.get_descriptor(dev, desc_type::DEVICE, 0, 0, &mut head)?;
        dev.max_packet0 = (head[7] as u16).max(8);

        self.set_address(dev, address)?;

        let mut raw = [0u8; 18];
        let n = self.get_descriptor(dev, desc_type::DEVICE, 0, 0, &mut raw)?;
        let (descriptor, _) =
            DeviceDescriptor::read_from_prefix(&raw[..n]).map_err(|_| UsbError::InvalidParameter)?;
        dev.descriptor = descriptor;

        let mut config = [0u8; MAX_CONFIG_SIZE];
        let n = self.get_descriptor(dev, desc_type::CONFIGURATION, 0, 0, &mut config[..9])?;
        let (header, _) = ConfigurationDescriptor::read_from_prefix(&config[..n])
            .map_err(|_| UsbError::InvalidParameter)?;
        let total = (header.total_length as usize).clamp(9, MAX_CONFIG_SIZE);
        let n = self.get_descriptor(dev, desc_type::CONFIGURATION, 0, 0, &mut config[..total])?;
        dev.config = parse_configuration(&config[..n]);

        if let Err(e) = self.read_strings(dev) {
            log::debug!("{}: string descriptors unavailable: {}", self.name(), e);
        }
        Ok(())
    }

    fn read_strings(&mut self, dev: &mut Device) -> Result<()> {
        let (product, serial) = (dev.descriptor.product, dev.descriptor.serial_number);
        if product == 0 && serial == 0 {
            return Ok(());
        }

        let mut table = [0u8; 4];
        let n = self.read_string_descriptor(dev, 0, 0, &mut table)?;
        if n < 4 {
            return Err(UsbError::InvalidParameter);
        }
        dev.language = u16::from_le_bytes([table[2], table[3]]);

        if product != 0 {
            dev.product = self.get_string(dev, product)?;
        }
        if serial != 0 {
            dev.serial = self.get_string(dev, serial)?;
        }
        Ok(())
    }

    /// Read a string descriptor and decode it from UTF-16LE. Characters that
    /// do not fit are dropped.
    pub fn get_string<const N: usize>(&mut self, dev: &mut Device, index: u8) -> Result<heapless::String<N>> {
        let mut raw = [0u8; 255];
        let language = dev.language;
        let n = self.read_string_descriptor(dev, index, language, &mut raw)?;

        let units = raw[2..n.max(2)]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
        let mut text = heapless::String::new();
        for c in char::decode_utf16(units) {
            if text.push(c.unwrap_or(char::REPLACEMENT_CHARACTER)).is_err() {
                break;
            }
        }
        Ok(text)
    }

    /// Fetch bLength first, then the whole descriptor, so the data stage
    /// never ends on a short packet
    fn read_string_descriptor(&mut self, dev: &mut Device, index: u8, language: u16, buf: &mut [u8]) -> Result<usize> {
        let mut header = [0u8; 2];
        self.get_descriptor(dev, desc_type::STRING, index, language, &mut header)?;
        let len = (header[0] as usize).min(buf.len());
        if len < 2 || header[1] != desc_type::STRING {
            return Err(UsbError::InvalidParameter);
        }
        self.get_descriptor(dev, desc_type::STRING, index, language, &mut buf[..len])
    }

    pub fn get_descriptor(
        &mut self,
        dev: &mut Device,
        kind: u8,
        index: u8,
        language: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        let setup = SetupPacket::new(
            req_type::DIR_IN | req_type::TYPE_STANDARD | req_type::RCPT_DEVICE,
            request::GET_DESCRIPTOR,
            ((kind as u16) << 8) | index as u16,
            language,
            buf.len() as u16,
        );
        self.control_transfer(dev, setup, Some(buf))
    }

    pub fn set_address(&mut self, dev: &mut Device, address: u8) -> Result<()> {
        let setup = SetupPacket::new(
            req_type::DIR_OUT | req_type::TYPE_STANDARD | req_type::RCPT_DEVICE,
            request::SET_ADDRESS,
            address as u16,
            0,
            0,
        );
        self.control_transfer(dev, setup, None)?;
        dev.address = address;
        self.platform.sleep_ms(self.config.set_address_recovery_ms);
        Ok(())
    }

    pub fn set_configuration(&mut self, dev: &mut Device, value: u8) -> Result<()> {
        let setup = SetupPacket::new(
            req_type::DIR_OUT | req_type::TYPE_STANDARD | req_type::RCPT_DEVICE,
            request::SET_CONFIGURATION,
            value as u16,
            0,
            0,
        );
        self.control_transfer(dev, setup, None)?;
        dev.configured = true;
        dev.reset_toggles();
        Ok(())
    }

    /// GET_STATUS for a device, interface or endpoint recipient
    pub fn get_status(&mut self, dev: &mut Device, recipient: u8, index: u16) -> Result<u16> {
        let setup = SetupPacket::new(
            req_type::DIR_IN | req_type::TYPE_STANDARD | (recipient & 0x1F),
            request::GET_STATUS,
            0,
            index,
            2,
        );
        let mut status = [0u8; 2];
        self.control_transfer(dev, setup, Some(&mut status))?;
        Ok(u16::from_le_bytes(status))
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT); the endpoint restarts at DATA0
    pub fn clear_feature_halt(&mut self, dev: &mut Device, endpoint: &EndpointInfo) -> Result<()> {
        let setup = SetupPacket::new(
            req_type::DIR_OUT | req_type::TYPE_STANDARD | req_type::RCPT_ENDPOINT,
            request::CLEAR_FEATURE,
            feature::ENDPOINT_HALT,
            endpoint.address() as u16,
            0,
        );
        self.control_transfer(dev, setup, None)?;
        dev.set_toggle(endpoint.number, endpoint.direction, false);
        Ok(())
    }
}
