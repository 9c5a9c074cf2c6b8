//! Legacy 8259 programmable interrupt controller.
//!
//! The kernel runs on the APIC; the PIC is remapped away from the CPU
//! exception range and masked at boot. Only the 8254 fallback path ever
//! unmasks a line here.

use x86_64::instructions::port::Port;

const PIC1_COMMAND_PORT: u16 = 0x20;
const PIC1_DATA_PORT: u16 = 0x21;
const PIC2_COMMAND_PORT: u16 = 0xA0;
const PIC2_DATA_PORT: u16 = 0xA1;

pub const PIC1_INTERRUPT_OFFSET: u8 = 32;
const PIC2_INTERRUPT_OFFSET: u8 = 40;

const EOI_COMMAND: u8 = 0x20;
const ICW1_INIT_WITH_ICW4: u8 = 0x11;
const ICW4_8086_MODE: u8 = 0x01;

fn write_command(port: u16, value: u8) {
	unsafe {
		Port::new(port).write(value);
	}
}

fn read_data(port: u16) -> u8 {
	unsafe { Port::new(port).read() }
}

/// Remap both PICs past the exception vectors and mask every line.
pub fn init() {
	write_command(PIC1_COMMAND_PORT, ICW1_INIT_WITH_ICW4);
	write_command(PIC2_COMMAND_PORT, ICW1_INIT_WITH_ICW4);
	write_command(PIC1_DATA_PORT, PIC1_INTERRUPT_OFFSET);
	write_command(PIC2_DATA_PORT, PIC2_INTERRUPT_OFFSET);
	write_command(PIC1_DATA_PORT, 0x04);
	write_command(PIC2_DATA_PORT, 0x02);
	write_command(PIC1_DATA_PORT, ICW4_8086_MODE);
	write_command(PIC2_DATA_PORT, ICW4_8086_MODE);

	write_command(PIC1_DATA_PORT, 0xFF);
	write_command(PIC2_DATA_PORT, 0xFF);
}

pub fn eoi(irq_number: u8) {
	if irq_number >= PIC2_INTERRUPT_OFFSET {
		write_command(PIC2_COMMAND_PORT, EOI_COMMAND);
	}
	write_command(PIC1_COMMAND_PORT, EOI_COMMAND);
}

pub fn mask(irq_number: u8) {
	change_mask(irq_number, true);
}

pub fn unmask(irq_number: u8) {
	change_mask(irq_number, false);
}

fn change_mask(irq_number: u8, insert: bool) {
	let (port, line) = if irq_number < 8 {
		(PIC1_DATA_PORT, irq_number)
	} else if irq_number < 16 {
		(PIC2_DATA_PORT, irq_number - 8)
	} else {
		return;
	};

	let mut value = read_data(port);
	if insert {
		value |= 1 << line;
	} else {
		value &= !(1 << line);
	}
	write_command(port, value);
}
