// Basalt Operating System
// Copyright (C) 2026 Basalt Contributors
// SPDX-License-Identifier: MIT
//
//! PCI configuration access over the legacy 0xCF8/0xCFC ports.

use spin::Mutex;
use x86_64::instructions::port::Port;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

const CLASS_MASS_STORAGE: u8 = 0x01;
const SUBCLASS_SATA: u8 = 0x06;
const PROG_IF_AHCI: u8 = 0x01;

/// Command register bits: memory space enable, bus master enable.
const COMMAND_MEMORY_SPACE: u16 = 1 << 1;
const COMMAND_BUS_MASTER: u16 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

/// Encode a configuration address: enable bit, bus, device, function, and
/// the dword-aligned register offset.
const fn config_address(addr: PciAddress, offset: u8) -> u32 {
    0x8000_0000
        | (addr.bus as u32) << 16
        | (addr.device as u32) << 11
        | (addr.function as u32) << 8
        | (offset as u32 & 0xFC)
}

// The address/data port pair is a single shared resource; accesses are
// serialized so a concurrent reader cannot tear an address/data cycle.
static CONFIG_PORTS: Mutex<()> = Mutex::new(());

pub fn read_config32(addr: PciAddress, offset: u8) -> u32 {
    let _guard = CONFIG_PORTS.lock();
    unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(config_address(addr, offset));
        Port::<u32>::new(CONFIG_DATA).read()
    }
}

pub fn read_config16(addr: PciAddress, offset: u8) -> u16 {
    (read_config32(addr, offset) >> ((offset & 2) * 8)) as u16
}

pub fn read_config8(addr: PciAddress, offset: u8) -> u8 {
    (read_config32(addr, offset) >> ((offset & 3) * 8)) as u8
}

pub fn write_config32(addr: PciAddress, offset: u8, value: u32) {
    let _guard = CONFIG_PORTS.lock();
    unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(config_address(addr, offset));
        Port::<u32>::new(CONFIG_DATA).write(value);
    }
}

/// Read-modify-write of one 16-bit half of an aligned config dword.
pub fn write_config16(addr: PciAddress, offset: u8, value: u16) {
    let shift = (offset as u32 & 2) * 8;
    let mask = 0xFFFFu32 << shift;
    let old = read_config32(addr, offset);
    write_config32(addr, offset, (old & !mask) | ((value as u32) << shift));
}

pub fn read_bar32(addr: PciAddress, bar_index: u8) -> u32 {
    read_config32(addr, 0x10 + bar_index * 4)
}

/// AHCI does DMA; make sure bus mastering and MMIO decoding are on.
pub fn enable_bus_master(addr: PciAddress) {
    let command = read_config16(addr, 0x04);
    let wanted = command | COMMAND_BUS_MASTER | COMMAND_MEMORY_SPACE;
    if wanted != command {
        write_config16(addr, 0x04, wanted);
        log_info!(
            "pci",
            "enabled bus mastering on {:02x}:{:02x}.{} (CMD {:#06x} -> {:#06x})",
            addr.bus,
            addr.device,
            addr.function,
            command,
            wanted
        );
    }
}

fn class_name(class: u8, subclass: u8, prog_if: u8) -> &'static str {
    match (class, subclass, prog_if) {
        (0x01, 0x06, 0x01) => "SATA (AHCI)",
        (0x02, _, _) => "Network controller",
        (0x03, _, _) => "Display controller",
        (0x0C, 0x03, _) => "USB controller",
        _ => "Other",
    }
}

/// Walk every bus/device/function, log what is there, and hand AHCI
/// controllers to the AHCI driver.
pub fn scan() {
    log_info!("pci", "scanning buses 0..255");

    for bus in 0..=255u8 {
        for device in 0..32u8 {
            for function in 0..8u8 {
                let addr = PciAddress { bus, device, function };
                let vendor = read_config16(addr, 0x00);
                if vendor == 0xFFFF {
                    if function == 0 {
                        break; // nothing at function 0 means no functions
                    }
                    continue;
                }

                let device_id = read_config16(addr, 0x02);
                let class = read_config8(addr, 0x0B);
                let subclass = read_config8(addr, 0x0A);
                let prog_if = read_config8(addr, 0x09);

                log_info!(
                    "pci",
                    "{:02x}:{:02x}.{} vendor={:#06x} device={:#06x} class={:02x}:{:02x} progIF={:02x} ({})",
                    bus,
                    device,
                    function,
                    vendor,
                    device_id,
                    class,
                    subclass,
                    prog_if,
                    class_name(class, subclass, prog_if)
                );

                if (class, subclass, prog_if)
                    == (CLASS_MASS_STORAGE, SUBCLASS_SATA, PROG_IF_AHCI)
                {
                    enable_bus_master(addr);
                    let bar5 = read_bar32(addr, 5);
                    // Low BAR bits are flags on MMIO BARs.
                    let mmio = (bar5 & !0xF) as u64;
                    log_info!(
                        "ahci",
                        "AHCI HBA at {:02x}:{:02x}.{} BAR5={:#010x} mmio={:#x}",
                        bus,
                        device,
                        function,
                        bar5,
                        mmio
                    );
                    crate::drivers::ahci::probe_controller(mmio);
                }
            }
        }
    }

    log_info!("pci", "PCI scan complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_address_encoding() {
        let addr = PciAddress { bus: 0xAB, device: 0x1F, function: 0x7 };
        let encoded = config_address(addr, 0x3E);
        assert_eq!(encoded & 0x8000_0000, 0x8000_0000);
        assert_eq!((encoded >> 16) & 0xFF, 0xAB);
        assert_eq!((encoded >> 11) & 0x1F, 0x1F);
        assert_eq!((encoded >> 8) & 0x7, 0x7);
        // Offsets are dword aligned in the cycle itself.
        assert_eq!(encoded & 0xFF, 0x3C);
    }

    #[test]
    fn ahci_class_triple_is_recognized() {
        assert_eq!(class_name(0x01, 0x06, 0x01), "SATA (AHCI)");
        assert_eq!(class_name(0x01, 0x06, 0x02), "Other");
    }
}
