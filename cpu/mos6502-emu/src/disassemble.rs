//! Mnemonic lookup for trace logging and the debugger's predictive disassembly.

/// Return the mnemonic for an opcode. Illegal NMOS opcodes return their conventional names.
#[must_use]
pub fn disassemble(opcode: u8) -> &'static str {
    match opcode {
        0x00 => "BRK",
        0x01 | 0x05 | 0x09 | 0x0D | 0x11 | 0x12 | 0x15 | 0x19 | 0x1D => "ORA",
        0x21 | 0x25 | 0x29 | 0x2D | 0x31 | 0x32 | 0x35 | 0x39 | 0x3D => "AND",
        0x41 | 0x45 | 0x49 | 0x4D | 0x51 | 0x52 | 0x55 | 0x59 | 0x5D => "EOR",
        0x61 | 0x65 | 0x69 | 0x6D | 0x71 | 0x72 | 0x75 | 0x79 | 0x7D => "ADC",
        0x81 | 0x85 | 0x8D | 0x91 | 0x92 | 0x95 | 0x99 | 0x9D => "STA",
        0xA1 | 0xA5 | 0xA9 | 0xAD | 0xB1 | 0xB2 | 0xB5 | 0xB9 | 0xBD => "LDA",
        0xC1 | 0xC5 | 0xC9 | 0xCD | 0xD1 | 0xD2 | 0xD5 | 0xD9 | 0xDD => "CMP",
        0xE1 | 0xE5 | 0xE9 | 0xEB | 0xED | 0xF1 | 0xF2 | 0xF5 | 0xF9 | 0xFD => "SBC",
        0x06 | 0x0A | 0x0E | 0x16 | 0x1E => "ASL",
        0x26 | 0x2A | 0x2E | 0x36 | 0x3E => "ROL",
        0x46 | 0x4A | 0x4E | 0x56 | 0x5E => "LSR",
        0x66 | 0x6A | 0x6E | 0x76 | 0x7E => "ROR",
        0xE6 | 0xEE | 0xF6 | 0xFE => "INC",
        0xC6 | 0xCE | 0xD6 | 0xDE => "DEC",
        0xA2 | 0xA6 | 0xAE | 0xB6 | 0xBE => "LDX",
        0xA0 | 0xA4 | 0xAC | 0xB4 | 0xBC => "LDY",
        0x86 | 0x8E | 0x96 => "STX",
        0x84 | 0x8C | 0x94 => "STY",
        0xE0 | 0xE4 | 0xEC => "CPX",
        0xC0 | 0xC4 | 0xCC => "CPY",
        0x24 | 0x2C | 0x34 | 0x3C | 0x89 => "BIT",
        0x10 => "BPL",
        0x30 => "BMI",
        0x50 => "BVC",
        0x70 => "BVS",
        0x90 => "BCC",
        0xB0 => "BCS",
        0xD0 => "BNE",
        0xF0 => "BEQ",
        0x80 => "BRA",
        0x20 => "JSR",
        0x40 => "RTI",
        0x4C | 0x6C | 0x7C => "JMP",
        0x60 => "RTS",
        0x08 => "PHP",
        0x28 => "PLP",
        0x48 => "PHA",
        0x68 => "PLA",
        0x5A => "PHY",
        0x7A => "PLY",
        0xDA => "PHX",
        0xFA => "PLX",
        0x18 => "CLC",
        0x38 => "SEC",
        0x58 => "CLI",
        0x78 => "SEI",
        0xB8 => "CLV",
        0xD8 => "CLD",
        0xF8 => "SED",
        0x8A => "TXA",
        0x98 => "TYA",
        0x9A => "TXS",
        0xA8 => "TAY",
        0xAA => "TAX",
        0xBA => "TSX",
        0x88 => "DEY",
        0xCA => "DEX",
        0xC8 => "INY",
        0xE8 => "INX",
        0x04 | 0x0C => "TSB",
        0x14 | 0x1C => "TRB",
        0x64 | 0x74 | 0x9C | 0x9E => "STZ",
        0x0F | 0x1F | 0x2F | 0x3F | 0x4F | 0x5F | 0x6F | 0x7F => "BBR",
        0x8F | 0x9F | 0xAF | 0xBF | 0xCF | 0xDF | 0xEF | 0xFF => "BBS",
        0x07 | 0x17 | 0x27 | 0x37 | 0x47 | 0x57 | 0x67 | 0x77 => "RMB",
        0x87 | 0x97 | 0xA7 | 0xB7 | 0xC7 | 0xD7 | 0xE7 | 0xF7 => "SMB",
        0x02 | 0x22 | 0x42 | 0x62 => "KIL",
        0xEA | 0x1A | 0x3A | 0x44 | 0x54 | 0x5C | 0x82 | 0xC2 | 0xD4 | 0xDC | 0xE2 | 0xF4
        | 0xFC => "NOP",
        _ => "???",
    }
}
