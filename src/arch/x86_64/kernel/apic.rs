//! Local APIC driver: the interrupt controller behind the `intc` trait.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::ptr;

use hermit_sync::{InterruptSpinMutex, OnceCell};
use memory_addresses::{PhysAddr, VirtAddr};
use x86_64::registers::model_specific::Msr;

use super::interrupts::{APIC_ERROR_VECTOR, SPURIOUS_VECTOR};
use super::isr::{self, IsrInfo, IsrStatus};
use super::processor;
use crate::devmgr::{self, Device, DeviceApi};
use crate::drivers::intc::{
	InterruptController, IpiDestMode, IpiKind, IpiLevel, IpiPacket, IpiShorthand, IpiTrigger,
};

const IA32_APIC_BASE: u32 = 0x1B;
const X2APIC_ENABLE: u64 = 1 << 10;

/// x2APIC MSR numbers; the xAPIC MMIO offset is `(msr & 0xFF) << 4`.
const IA32_X2APIC_ID: u32 = 0x802;
const IA32_X2APIC_TPR: u32 = 0x808;
const IA32_X2APIC_EOI: u32 = 0x80B;
const IA32_X2APIC_SIVR: u32 = 0x80F;
const IA32_X2APIC_ESR: u32 = 0x828;
const IA32_X2APIC_ICR: u32 = 0x830;
const IA32_X2APIC_LVT_TIMER: u32 = 0x832;
const IA32_X2APIC_LVT_LINT0: u32 = 0x835;
const IA32_X2APIC_LVT_LINT1: u32 = 0x836;
const IA32_X2APIC_LVT_ERROR: u32 = 0x837;
pub(super) const IA32_X2APIC_INIT_COUNT: u32 = 0x838;
pub(super) const IA32_X2APIC_CUR_COUNT: u32 = 0x839;
pub(super) const IA32_X2APIC_DIV_CONF: u32 = 0x83E;

const APIC_EOI_ACK: u64 = 0;
const APIC_ICR_DELIVERY_STATUS_PENDING: u32 = 1 << 12;
const APIC_LVT_MASK: u64 = 1 << 16;
const APIC_SIVR_ENABLED: u64 = 1 << 8;

static LOCAL_APIC_ADDRESS: OnceCell<VirtAddr> = OnceCell::new();

/// Local APIC IDs of all online CPUs, indexed by core id.
static CPU_LOCAL_APIC_IDS: InterruptSpinMutex<Vec<u32>> = InterruptSpinMutex::new(Vec::new());

pub fn add_local_apic_id(id: u32) {
	CPU_LOCAL_APIC_IDS.lock().push(id);
}

pub fn local_apic_id_for_core(core_id: u32) -> Option<u32> {
	CPU_LOCAL_APIC_IDS.lock().get(core_id as usize).copied()
}

fn xapic_address(x2apic_msr: u32) -> *mut u32 {
	let offset = (u64::from(x2apic_msr) & 0xFF) << 4;
	(LOCAL_APIC_ADDRESS.get().unwrap().as_u64() + offset) as *mut u32
}

fn local_apic_read(x2apic_msr: u32) -> u32 {
	if processor::supports_x2apic() {
		unsafe { Msr::new(x2apic_msr).read() as u32 }
	} else {
		unsafe { ptr::read_volatile(xapic_address(x2apic_msr)) }
	}
}

fn local_apic_write(x2apic_msr: u32, value: u64) {
	if processor::supports_x2apic() {
		unsafe {
			Msr::new(x2apic_msr).write(value);
		}
	} else {
		if x2apic_msr == IA32_X2APIC_ICR {
			// xAPIC splits the ICR: the destination lives in the upper
			// register and is only 8 bits wide.
			let destination = ((value >> 32) as u32) << 24;
			unsafe {
				ptr::write_volatile(xapic_address(0x831), destination);
			}
		}

		let target = xapic_address(x2apic_msr);
		unsafe {
			ptr::write_volatile(target, value as u32);
		}

		if x2apic_msr == IA32_X2APIC_ICR {
			// Wait for the delivery-status bit; it does not exist in x2APIC mode.
			while unsafe { ptr::read_volatile(target) } & APIC_ICR_DELIVERY_STATUS_PENDING > 0 {
				spin_loop();
			}
		}
	}
}

/// Translate an [`IpiPacket`] into interrupt-command-register bits.
pub(crate) fn encode_icr(packet: &IpiPacket) -> u64 {
	let mut icr = u64::from(packet.vector);

	let delivery_mode: u64 = match packet.kind {
		IpiKind::Fixed => 0b000,
		IpiKind::Nmi => 0b100,
		IpiKind::Init => 0b101,
		IpiKind::Startup => 0b110,
	};
	icr |= delivery_mode << 8;

	if packet.dest_mode == IpiDestMode::Logical {
		icr |= 1 << 11;
	}
	if packet.level == IpiLevel::Assert {
		icr |= 1 << 14;
	}
	if packet.trigger == IpiTrigger::Level {
		icr |= 1 << 15;
	}

	let shorthand: u64 = match packet.shorthand {
		IpiShorthand::None => 0b00,
		IpiShorthand::SelfOnly => 0b01,
		IpiShorthand::AllIncludingSelf => 0b10,
		IpiShorthand::AllExcludingSelf => 0b11,
	};
	icr |= shorthand << 18;

	if packet.shorthand == IpiShorthand::None {
		icr |= u64::from(packet.dest_cpu) << 32;
	}

	icr
}

pub struct LocalApic(());

impl InterruptController for LocalApic {
	fn enable(&self) {
		local_apic_write(
			IA32_X2APIC_SIVR,
			APIC_SIVR_ENABLED | u64::from(SPURIOUS_VECTOR),
		);
	}

	fn disable(&self) {
		local_apic_write(IA32_X2APIC_SIVR, u64::from(SPURIOUS_VECTOR));
	}

	fn mask(&self, line: u8) {
		if let Some(lvt) = lvt_register(line) {
			let value = u64::from(local_apic_read(lvt));
			local_apic_write(lvt, value | APIC_LVT_MASK);
		}
	}

	fn unmask(&self, line: u8) {
		if let Some(lvt) = lvt_register(line) {
			let value = u64::from(local_apic_read(lvt));
			local_apic_write(lvt, value & !APIC_LVT_MASK);
		}
	}

	fn send_ipi(&self, packet: &IpiPacket) {
		local_apic_write(IA32_X2APIC_ICR, encode_icr(packet));
	}

	fn end_of_interrupt(&self) {
		local_apic_write(IA32_X2APIC_EOI, APIC_EOI_ACK);
	}
}

/// Local lines addressable through mask/unmask: timer, LINT0, LINT1.
fn lvt_register(line: u8) -> Option<u32> {
	match line {
		0 => Some(IA32_X2APIC_LVT_TIMER),
		1 => Some(IA32_X2APIC_LVT_LINT0),
		2 => Some(IA32_X2APIC_LVT_LINT1),
		_ => None,
	}
}

static CONTROLLER: OnceCell<Arc<LocalApic>> = OnceCell::new();

pub fn controller() -> Arc<LocalApic> {
	CONTROLLER.get().expect("APIC is not initialized").clone()
}

pub fn eoi() {
	local_apic_write(IA32_X2APIC_EOI, APIC_EOI_ACK);
}

fn eoi_chain_handler(_cookie: usize, info: &IsrInfo) -> IsrStatus {
	// Exceptions are acknowledged implicitly and the spurious vector
	// must never be acknowledged at all.
	if info.vector >= 32 && info.vector != SPURIOUS_VECTOR {
		eoi();
		IsrStatus::Handled
	} else {
		IsrStatus::NotHandled
	}
}

fn error_interrupt(_cookie: usize, _info: &IsrInfo) -> IsrStatus {
	error!("APIC LVT error, ESR = {:#X}", local_apic_read(IA32_X2APIC_ESR));
	IsrStatus::Handled
}

fn spurious_interrupt(_cookie: usize, _info: &IsrInfo) -> IsrStatus {
	debug!("spurious APIC interrupt");
	IsrStatus::Handled
}

/// Detect and switch on the local APIC of the boot processor.
pub fn init() {
	// Collect the controller ids of every startable CPU. The boot CPU's
	// own id leads the list so core ids and list indices line up.
	let boot_id = if processor::supports_x2apic() {
		enable_x2apic();
		local_apic_read(IA32_X2APIC_ID)
	} else {
		let phys = apic_base_address();
		let virt = crate::mm::map_device_page(phys).expect("cannot map the local APIC");
		LOCAL_APIC_ADDRESS.set(virt).unwrap();
		debug!("Mapped local APIC {phys:p} at {virt:p}");
		local_apic_read(IA32_X2APIC_ID) >> 24
	};

	add_local_apic_id(boot_id);
	for cpu in crate::env::cpu_topology() {
		if cpu.startable() && cpu.apic_id != boot_id {
			add_local_apic_id(cpu.apic_id);
		}
	}

	isr::install(error_interrupt, 0, APIC_ERROR_VECTOR, false);
	isr::install(spurious_interrupt, 0, SPURIOUS_VECTOR, false);
	isr::install(eoi_chain_handler, 0, 0, true);

	CONTROLLER.set(Arc::new(LocalApic(()))).map_err(drop).unwrap();

	let id = devmgr::dev_add(
		Device::new("lapic", 0).with_api(DeviceApi::InterruptController(controller())),
	);
	debug!("Local APIC registered as device {id}");

	init_local();
}

fn apic_base_address() -> PhysAddr {
	let base = unsafe { Msr::new(IA32_APIC_BASE).read() };
	PhysAddr::new(base & 0xF_FFFF_F000)
}

fn enable_x2apic() {
	debug!("Enabling x2APIC mode");
	unsafe {
		let mut base = Msr::new(IA32_APIC_BASE).read();
		base |= X2APIC_ENABLE;
		Msr::new(IA32_APIC_BASE).write(base);
	}
}

/// Per-CPU part of the APIC setup, run on the BSP and on every AP.
pub fn init_local() {
	if processor::supports_x2apic() {
		enable_x2apic();
	}

	// Mask the local lines until someone asks for them.
	local_apic_write(IA32_X2APIC_LVT_TIMER, APIC_LVT_MASK);
	local_apic_write(IA32_X2APIC_LVT_LINT0, APIC_LVT_MASK);
	local_apic_write(IA32_X2APIC_LVT_LINT1, APIC_LVT_MASK);
	local_apic_write(IA32_X2APIC_LVT_ERROR, u64::from(APIC_ERROR_VECTOR));

	// Accept every priority class.
	local_apic_write(IA32_X2APIC_TPR, 0x00);

	controller().enable();
}

/// Map the xAPIC page into the address space of an application processor.
pub fn init_local_ap() {
	if !processor::supports_x2apic() {
		// The window was established by the BSP; the shared kernel context
		// already maps it.
		assert!(LOCAL_APIC_ADDRESS.get().is_some());
	}
	init_local();
}

pub(super) fn timer_lvt_write(value: u64) {
	local_apic_write(IA32_X2APIC_LVT_TIMER, value);
}

pub(super) fn timer_register_read(msr: u32) -> u32 {
	local_apic_read(msr)
}

pub(super) fn timer_register_write(msr: u32, value: u64) {
	local_apic_write(msr, value);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn icr_encoding_init() {
		let packet = IpiPacket {
			dest_mode: IpiDestMode::Physical,
			shorthand: IpiShorthand::None,
			kind: IpiKind::Init,
			level: IpiLevel::Assert,
			trigger: IpiTrigger::Edge,
			vector: 0,
			dest_cpu: 3,
		};

		let icr = encode_icr(&packet);
		assert_eq!(icr & 0xFF, 0);
		assert_eq!((icr >> 8) & 0b111, 0b101);
		assert_eq!((icr >> 14) & 1, 1);
		assert_eq!((icr >> 18) & 0b11, 0b00);
		assert_eq!(icr >> 32, 3);
	}

	#[test]
	fn icr_encoding_broadcast_fixed() {
		let packet = IpiPacket {
			shorthand: IpiShorthand::AllExcludingSelf,
			vector: 239,
			dest_cpu: 7,
			..IpiPacket::default()
		};

		let icr = encode_icr(&packet);
		assert_eq!(icr & 0xFF, 239);
		assert_eq!((icr >> 18) & 0b11, 0b11);
		// Shorthand broadcasts ignore the destination field.
		assert_eq!(icr >> 32, 0);
	}

	#[test]
	fn icr_encoding_startup_vector_is_page_number() {
		let packet = IpiPacket {
			kind: IpiKind::Startup,
			vector: (0x8000_u64 >> 12) as u8,
			dest_cpu: 1,
			..IpiPacket::default()
		};

		let icr = encode_icr(&packet);
		assert_eq!(icr & 0xFF, 0x08);
		assert_eq!((icr >> 8) & 0b111, 0b110);
	}
}
