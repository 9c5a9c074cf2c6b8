//! CPU feature discovery and the per-CPU baseline setup.

use core::arch::x86_64::_rdtsc;
use core::hint::spin_loop;

use hermit_sync::Lazy;
use raw_cpuid::CpuId;
#[cfg(target_os = "none")]
use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
#[cfg(target_os = "none")]
use x86_64::registers::model_specific::{Efer, EferFlags, Msr};

/// Memory-type assignments programmed into the PAT on every CPU:
/// PA0=WB, PA1=WT, PA2=UC-, PA3=UC, PA4=WC, PA5=WP, PA6=UC-, PA7=UC.
const PAT_LAYOUT: u64 = 0x0007_0501_0007_0406;

#[cfg(target_os = "none")]
const IA32_PAT: u32 = 0x277;

struct CpuFeatures {
	physical_address_bits: u8,
	linear_address_bits: u8,
	x2apic: bool,
	nx: bool,
	la57: bool,
	tsc_deadline: bool,
	gib_pages: bool,
}

static FEATURES: Lazy<CpuFeatures> = Lazy::new(|| {
	let cpuid = CpuId::new();
	let features = cpuid.get_feature_info();
	let extended = cpuid.get_extended_processor_and_feature_identifiers();
	let extended_features = cpuid.get_extended_feature_info();
	let address_info = cpuid.get_processor_capacity_feature_info();

	CpuFeatures {
		physical_address_bits: address_info
			.as_ref()
			.map_or(36, |info| info.physical_address_bits()),
		linear_address_bits: address_info
			.as_ref()
			.map_or(48, |info| info.linear_address_bits()),
		x2apic: features.as_ref().is_some_and(|f| f.has_x2apic()),
		nx: extended.as_ref().is_some_and(|f| f.has_execute_disable()),
		la57: extended_features.as_ref().is_some_and(|f| f.has_la57()),
		tsc_deadline: features.as_ref().is_some_and(|f| f.has_tsc_deadline()),
		gib_pages: extended.as_ref().is_some_and(|f| f.has_1gib_pages()),
	}
});

/// TSC frequency in MHz.
static CPU_FREQUENCY_MHZ: Lazy<u64> = Lazy::new(detect_frequency);

static BOOT_TSC: Lazy<u64> = Lazy::new(|| unsafe { _rdtsc() });

pub fn get_physical_address_bits() -> u8 {
	FEATURES.physical_address_bits
}

pub fn get_linear_address_bits() -> u8 {
	FEATURES.linear_address_bits
}

pub fn supports_x2apic() -> bool {
	FEATURES.x2apic
}

pub fn supports_nx() -> bool {
	FEATURES.nx
}

/// Whether the CPU can run with five paging levels (57-bit linear addresses).
pub fn supports_5_level_paging() -> bool {
	FEATURES.la57
}

pub fn supports_tsc_deadline() -> bool {
	FEATURES.tsc_deadline
}

pub fn supports_1gib_pages() -> bool {
	FEATURES.gib_pages
}

fn detect_frequency() -> u64 {
	let cpuid = CpuId::new();

	if let Some(info) = cpuid.get_tsc_info()
		&& let Some(freq) = info.tsc_frequency()
	{
		return freq / 1_000_000;
	}

	if let Some(info) = cpuid.get_processor_frequency_info() {
		let mhz = u64::from(info.processor_base_frequency());
		if mhz > 0 {
			return mhz;
		}
	}

	#[cfg(target_os = "none")]
	{
		let measured = calibrate_tsc_with_pit();
		if measured > 0 {
			return measured;
		}
	}

	warn!("Could not detect the TSC frequency, assuming 2000 MHz");
	2000
}

/// Measure the TSC against a 50 ms window of the 8254.
#[cfg(target_os = "none")]
fn calibrate_tsc_with_pit() -> u64 {
	let start = unsafe { _rdtsc() };
	super::pit::wait_ms(50);
	let end = unsafe { _rdtsc() };

	(end - start) / 50_000
}

/// CPU frequency in MHz.
pub fn get_frequency() -> u64 {
	*CPU_FREQUENCY_MHZ
}

/// Microseconds since the time base was initialized on the boot processor.
pub fn get_timer_ticks() -> u64 {
	(unsafe { _rdtsc() } - *BOOT_TSC) / *CPU_FREQUENCY_MHZ
}

/// Milliseconds since boot.
pub fn get_timer_ticks_ms() -> u64 {
	get_timer_ticks() / 1000
}

/// Busy-wait for the given number of microseconds.
pub fn udelay(usecs: u64) {
	let deadline = get_timer_ticks() + usecs;
	while get_timer_ticks() < deadline {
		spin_loop();
	}
}

/// Baseline control-register and PAT state, run on every CPU before it
/// touches the shared page tables.
#[cfg(target_os = "none")]
pub fn configure() {
	unsafe {
		let mut cr0 = Cr0::read();
		cr0.insert(Cr0Flags::WRITE_PROTECT | Cr0Flags::MONITOR_COPROCESSOR | Cr0Flags::NUMERIC_ERROR);
		cr0.remove(Cr0Flags::CACHE_DISABLE | Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::EMULATE_COPROCESSOR);
		Cr0::write(cr0);

		let mut cr4 = Cr4::read();
		cr4.insert(Cr4Flags::PAGE_GLOBAL | Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
		Cr4::write(cr4);

		if supports_nx() {
			Efer::update(|efer| efer.insert(EferFlags::NO_EXECUTE_ENABLE));
		}

		Msr::new(IA32_PAT).write(PAT_LAYOUT);
	}

	// The PAT write must be visible before any mapping selects an index.
	crate::arch::mm::paging::flush_tlb_local();
}

pub fn print_information() {
	let cpuid = CpuId::new();
	let brand = cpuid.get_processor_brand_string();

	infoheader!(" CPU INFORMATION ");
	if let Some(brand) = &brand {
		infoentry!("Model", brand.as_str());
	}
	infoentry!("Frequency", "{} MHz", get_frequency());
	infoentry!("Physical address width", "{} bits", get_physical_address_bits());
	infoentry!("x2APIC", supports_x2apic());
	infoentry!("NX", supports_nx());
	infoentry!("5-level paging", supports_5_level_paging());
	infofooter!();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn pat_layout_matches_assignment() {
		// PA0=WB(06) PA1=WT(04) PA2=UC-(07) PA3=UC(00)
		// PA4=WC(01) PA5=WP(05) PA6=UC-(07) PA7=UC(00)
		let entries: [u8; 8] = PAT_LAYOUT.to_le_bytes();
		assert_eq!(entries, [0x06, 0x04, 0x07, 0x00, 0x01, 0x05, 0x07, 0x00]);
	}

	#[test]
	fn timer_ticks_advance() {
		let first = get_timer_ticks();
		udelay(10);
		assert!(get_timer_ticks() >= first);
	}
}
