//! Firmware-provided boot records.
//!
//! Table parsing happens in the boot shim; the kernel only consumes the
//! typed records handed over before `boot_processor_main` runs. The
//! record slices must live inside the kernel image (the shim copies them
//! into kernel data), since the boot-time mappings they might otherwise
//! sit in disappear when the kernel switches to its own page tables.

use hermit_sync::OnceCell;

/// Classification of a firmware memory range.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemoryKind {
	Usable,
	Reserved,
	AcpiReclaim,
	AcpiNvs,
	Bad,
}

bitflags::bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct RegionFlags: u32 {
		const ENABLED = 1 << 0;
	}
}

/// One record of the firmware memory map.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion {
	pub base: u64,
	pub length: u64,
	pub kind: MemoryKind,
	pub flags: RegionFlags,
	pub proximity_domain: u32,
}

/// One record of the firmware CPU topology table.
#[derive(Clone, Copy, Debug)]
pub struct CpuTopologyEntry {
	pub apic_id: u32,
	pub enabled: bool,
	pub online_capable: bool,
}

impl CpuTopologyEntry {
	/// Whether bring-up should attempt to start this processor.
	pub fn startable(&self) -> bool {
		self.enabled || self.online_capable
	}
}

/// Everything the boot shim hands over.
pub struct BootTables {
	pub memory_map: &'static [MemoryRegion],
	pub cpus: &'static [CpuTopologyEntry],
	pub command_line: Option<&'static str>,
}

static BOOT_TABLES: OnceCell<BootTables> = OnceCell::new();

/// Install the boot records. Must happen exactly once, before kernel init.
pub fn set_boot_tables(tables: BootTables) {
	BOOT_TABLES
		.set(tables)
		.map_err(drop)
		.expect("boot tables are already set");
}

fn boot_tables() -> &'static BootTables {
	BOOT_TABLES.get().expect("boot tables are not set")
}

pub(crate) fn memory_map() -> impl Iterator<Item = MemoryRegion> {
	boot_tables().memory_map.iter().copied()
}

pub(crate) fn cpu_topology() -> impl Iterator<Item = CpuTopologyEntry> {
	boot_tables().cpus.iter().copied()
}

/// Number of processors the firmware reports as startable.
pub(crate) fn startable_cpu_count() -> u32 {
	cpu_topology().filter(CpuTopologyEntry::startable).count() as u32
}

fn command_line_value(key: &str) -> Option<&'static str> {
	let cmdline = boot_tables().command_line?;
	cmdline
		.split_whitespace()
		.find_map(|arg| arg.strip_prefix(key)?.strip_prefix('='))
}

pub(crate) fn log_level() -> Option<&'static str> {
	if BOOT_TABLES.get().is_none() {
		return None;
	}
	command_line_value("loglevel")
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn startable_records() {
		let enabled = CpuTopologyEntry {
			apic_id: 0,
			enabled: true,
			online_capable: false,
		};
		let capable = CpuTopologyEntry {
			apic_id: 1,
			enabled: false,
			online_capable: true,
		};
		let off = CpuTopologyEntry {
			apic_id: 2,
			enabled: false,
			online_capable: false,
		};

		assert!(enabled.startable());
		assert!(capable.startable());
		assert!(!off.startable());
	}
}
