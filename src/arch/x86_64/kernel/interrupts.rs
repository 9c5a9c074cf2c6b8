use alloc::collections::BTreeMap;

use hermit_sync::{InterruptSpinMutex, InterruptTicketMutex};
use x86_64::registers::control::Cr2;
use x86_64::set_general_handler;
use x86_64::structures::idt::{InterruptDescriptorTable, PageFaultErrorCode};

use super::isr::{self, IsrInfo};

pub use x86_64::instructions::interrupts::{disable, enable, enable_and_hlt as enable_and_wait};
pub use x86_64::structures::idt::InterruptStackFrame as ExceptionStackFrame;

/// Architectural page-fault vector.
pub const PAGE_FAULT_VECTOR: u8 = 14;
/// Per-CPU local timer tick.
pub const LOCAL_TIMER_VECTOR: u8 = 238;
/// Cross-CPU TLB invalidation request.
pub const PAGE_INVALIDATE_VECTOR: u8 = 239;
/// Reschedule / deferred-call request.
pub const SCHED_VECTOR: u8 = 240;
/// Local APIC LVT error reporting.
pub const APIC_ERROR_VECTOR: u8 = 254;
/// Local APIC spurious vector.
pub const SPURIOUS_VECTOR: u8 = 255;

static IDT: InterruptSpinMutex<InterruptDescriptorTable> =
	InterruptSpinMutex::new(InterruptDescriptorTable::new());

pub(crate) static IRQ_COUNTERS: InterruptTicketMutex<BTreeMap<u32, &'static IrqStatistics>> =
	InterruptTicketMutex::new(BTreeMap::new());

/// Load the IDT register on the calling CPU.
pub fn load_idt() {
	unsafe {
		IDT.lock().load_unsafe();
	}
}

/// Populate the shared IDT.
///
/// Exceptions 0–20 get typed handlers; the architecturally reserved
/// entries (15, 21–31) keep benign stubs the typed table never exposes.
/// Every vector from 32 up funnels into the dispatch chains.
pub fn install() {
	let mut idt = IDT.lock();

	set_general_handler!(&mut *idt, abort_exception, 0..14);
	set_general_handler!(&mut *idt, abort_exception, 16..21);
	set_general_handler!(&mut *idt, common_interrupt, 32..);

	unsafe {
		idt.double_fault
			.set_handler_fn(double_fault_exception)
			.set_stack_index(0);
		idt.page_fault.set_handler_fn(page_fault_exception);
	}
}

fn abort_exception(stack_frame: ExceptionStackFrame, index: u8, error_code: Option<u64>) {
	error!("CPU exception {index} (error code {error_code:?})");
	error!("{stack_frame:#?}");
	crate::scheduler::abort_current();
}

extern "x86-interrupt" fn double_fault_exception(
	stack_frame: ExceptionStackFrame,
	error_code: u64,
) -> ! {
	panic!("Double Fault (#DF) Exception, error {error_code:#X}: {stack_frame:#?}");
}

extern "x86-interrupt" fn page_fault_exception(
	stack_frame: ExceptionStackFrame,
	error_code: PageFaultErrorCode,
) {
	let faulting_address = Cr2::read()
		.map(|addr| addr.as_u64())
		.unwrap_or_default();

	let resolved = crate::mm::virtualmem::handle_page_fault(
		memory_addresses::VirtAddr::new(faulting_address),
		error_code.bits(),
	);

	if !resolved {
		error!("Page fault (#PF) in kernel mode");
		error!("faulting address = {faulting_address:#X}");
		error!("error code = {error_code:?}");
		error!("rip = {:#X}", stack_frame.instruction_pointer.as_u64());
		error!("rflags = {:#X}", stack_frame.cpu_flags.bits());
		// Hang this CPU; the others keep running.
		loop {
			x86_64::instructions::hlt();
		}
	}
}

fn common_interrupt(stack_frame: ExceptionStackFrame, index: u8, error_code: Option<u64>) {
	increment_irq_counter(index);

	let info = IsrInfo {
		vector: index,
		error_code,
		instruction_pointer: stack_frame.instruction_pointer.as_u64(),
		cpu_flags: stack_frame.cpu_flags.bits(),
	};

	if isr::dispatch(&info) == isr::IsrStatus::NotHandled && index >= 32 {
		debug!("unclaimed interrupt {index}");
	}

	// The controller was acknowledged by the EOI chain; a preemption
	// request can now switch threads safely.
	if crate::scheduler::needs_reschedule() {
		crate::scheduler::reschedule();
	}
}

#[repr(align(64))]
pub(crate) struct IrqStatistics {
	pub counters: [core::sync::atomic::AtomicU64; 256],
}

impl IrqStatistics {
	pub const fn new() -> Self {
		IrqStatistics {
			counters: [const { core::sync::atomic::AtomicU64::new(0) }; 256],
		}
	}

	pub fn inc(&self, pos: u8) {
		// Relaxed is enough for diagnostic counters.
		self.counters[usize::from(pos)].fetch_add(1, core::sync::atomic::Ordering::Relaxed);
	}
}

pub(crate) fn increment_irq_counter(vector: u8) {
	super::core_local::with_irq_statistics(|stats| stats.inc(vector));
}

pub(crate) fn print_statistics() {
	infoheader!(" INTERRUPT STATISTICS ");
	for (core_id, stats) in IRQ_COUNTERS.lock().iter() {
		for (vector, count) in stats.counters.iter().enumerate() {
			let count = count.load(core::sync::atomic::Ordering::Relaxed);
			if count > 0 {
				infoentry!("Core", "{core_id} vector {vector}: {count}");
			}
		}
	}
	infofooter!();
}
