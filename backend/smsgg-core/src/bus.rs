//! The Z80-facing bus: memory map plus the I/O port space that hosts the VDP, PSG, and
//! controller ports.

use crate::input::InputState;
use crate::memory::Memory;
use crate::psg::Psg;
use crate::vdp::Vdp;
use crate::SmsGgHardware;
use bincode::{Decode, Encode};
use nexen_common::cheats::CheatTable;
use nexen_proc_macros::PartialClone;
use z80_emu::traits::{BusInterface, InterruptLine};

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Bus {
    #[partial_clone(partial)]
    pub(crate) memory: Memory,
    pub(crate) vdp: Vdp,
    pub(crate) psg: Psg,
    pub(crate) input: InputState,
    hardware: SmsGgHardware,
    nmi_pending: bool,
    pub(crate) cheats: CheatTable,
}

impl Bus {
    pub(crate) fn new(memory: Memory, hardware: SmsGgHardware) -> Self {
        Self {
            memory,
            vdp: Vdp::new(hardware),
            psg: Psg::new(),
            input: InputState::default(),
            hardware,
            nmi_pending: false,
            cheats: CheatTable::new(),
        }
    }

    pub(crate) fn set_nmi_pending(&mut self, pending: bool) {
        self.nmi_pending = pending;
    }
}

impl BusInterface for Bus {
    fn read_memory(&mut self, address: u16) -> u8 {
        let value = self.memory.read(address);
        if self.cheats.is_empty() { value } else { self.cheats.apply(address.into(), value) }
    }

    fn write_memory(&mut self, address: u16, value: u8) {
        self.memory.write(address, value);
    }

    fn read_io(&mut self, address: u16) -> u8 {
        let port = address as u8;
        match port {
            // Game Gear extension ports
            0x00..=0x06 if self.hardware == SmsGgHardware::GameGear => match port {
                0x00 => self.input.read_gg_start(),
                _ => 0xFF,
            },
            0x40..=0x7F => {
                if port % 2 == 0 {
                    self.vdp.read_v_counter()
                } else {
                    self.vdp.read_h_counter()
                }
            }
            0x80..=0xBF => {
                if port % 2 == 0 {
                    self.vdp.read_data()
                } else {
                    self.vdp.read_status()
                }
            }
            0xC0..=0xFF => {
                if port % 2 == 0 {
                    self.input.read_port_dc()
                } else {
                    self.input.read_port_dd()
                }
            }
            _ => 0xFF,
        }
    }

    fn write_io(&mut self, address: u16, value: u8) {
        let port = address as u8;
        match port {
            0x06 if self.hardware == SmsGgHardware::GameGear => {
                self.psg.write_stereo_control(value);
            }
            0x00..=0x3F => {
                // $3E memory control / $3F I/O control: TH latching triggers an H counter
                // latch, which is all the core models
                if port % 2 == 1 {
                    self.vdp.latch_h_counter();
                }
            }
            0x40..=0x7F => self.psg.write(value),
            0x80..=0xBF => {
                if port % 2 == 0 {
                    self.vdp.write_data(value);
                } else {
                    self.vdp.write_control(value);
                }
            }
            _ => {}
        }
    }

    fn nmi(&self) -> InterruptLine {
        if self.nmi_pending { InterruptLine::Low } else { InterruptLine::High }
    }

    fn int(&self) -> InterruptLine {
        if self.vdp.interrupt_line() { InterruptLine::Low } else { InterruptLine::High }
    }

    fn busreq(&self) -> bool {
        false
    }

    fn reset(&self) -> bool {
        false
    }
}
