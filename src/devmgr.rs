//! Device and driver registry.
//!
//! The core never talks to hardware directly; CPUs, timers and the
//! interrupt controller register here and are looked up by name.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

use ahash::RandomState;
use hashbrown::HashMap;
use hermit_sync::{InterruptTicketMutex, SpinMutex};

use crate::drivers::intc::InterruptController;
use crate::drivers::timer::TimerDevice;

pub type DeviceId = u32;

/// Per-CPU record registered by the bring-up path.
#[derive(Debug)]
pub struct CpuInfo {
	pub core_id: u32,
	pub apic_id: u32,
	pub proximity_domain: u32,
}

/// Typed API surface a device exposes to the core.
#[derive(Clone, Default)]
pub enum DeviceApi {
	#[default]
	None,
	Cpu(Arc<CpuInfo>),
	Timer(Arc<dyn TimerDevice>),
	InterruptController(Arc<dyn InterruptController>),
}

impl DeviceApi {
	fn kind(&self) -> &'static str {
		match self {
			Self::None => "none",
			Self::Cpu(_) => "cpu",
			Self::Timer(_) => "timer",
			Self::InterruptController(_) => "intc",
		}
	}
}

pub struct Device {
	name: &'static str,
	index: u32,
	parent: Option<DeviceId>,
	api: DeviceApi,
	data: SpinMutex<Option<Box<dyn Any + Send>>>,
}

impl Device {
	pub fn new(name: &'static str, index: u32) -> Self {
		Self {
			name,
			index,
			parent: None,
			api: DeviceApi::None,
			data: SpinMutex::new(None),
		}
	}

	pub fn with_api(mut self, api: DeviceApi) -> Self {
		self.api = api;
		self
	}

	pub fn with_parent(mut self, parent: DeviceId) -> Self {
		self.parent = Some(parent);
		self
	}

	pub fn name(&self) -> &'static str {
		self.name
	}

	pub fn index(&self) -> u32 {
		self.index
	}

	pub fn api(&self) -> DeviceApi {
		self.api.clone()
	}

	pub fn parent(&self) -> Option<DeviceId> {
		self.parent
	}

	pub fn name_matches(&self, name: &str) -> bool {
		self.name == name
	}

	pub fn type_matches(&self, kind: &str) -> bool {
		self.api.kind() == kind
	}

	pub fn set_data<T: Any + Send>(&self, data: T) {
		*self.data.lock() = Some(Box::new(data));
	}

	pub fn with_data<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
		let mut guard = self.data.lock();
		guard.as_mut()?.downcast_mut::<T>().map(f)
	}
}

impl fmt::Debug for Device {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Device")
			.field("name", &self.name)
			.field("index", &self.index)
			.field("api", &self.api.kind())
			.finish()
	}
}

/// Operations every registered driver provides.
pub trait Driver: Send + Sync {
	fn name(&self) -> &'static str;
	/// One-time initialization, run from `drv_init`.
	fn init(&self) -> Result<(), ()> {
		Ok(())
	}
}

struct Registry {
	devices: HashMap<DeviceId, Arc<Device>, RandomState>,
	by_name: HashMap<(&'static str, u32), DeviceId, RandomState>,
	drivers: HashMap<&'static str, Arc<dyn Driver>, RandomState>,
	driver_data: HashMap<&'static str, Box<dyn Any + Send>, RandomState>,
	next_id: DeviceId,
}

impl Registry {
	const fn new() -> Self {
		Self {
			devices: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
			by_name: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
			drivers: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
			driver_data: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
			next_id: 1,
		}
	}
}

static REGISTRY: InterruptTicketMutex<Registry> = InterruptTicketMutex::new(Registry::new());

/// Register a device and return its id.
pub fn dev_add(device: Device) -> DeviceId {
	let mut registry = REGISTRY.lock();
	let id = registry.next_id;
	registry.next_id += 1;

	debug!("Registering device {}.{} as {}", device.name, device.index, id);

	registry.by_name.insert((device.name, device.index), id);
	registry.devices.insert(id, Arc::new(device));
	id
}

pub fn dev_get(id: DeviceId) -> Option<Arc<Device>> {
	REGISTRY.lock().devices.get(&id).cloned()
}

pub fn dev_get_by_name(name: &str, index: u32) -> Option<Arc<Device>> {
	let registry = REGISTRY.lock();
	let id = registry.by_name.get(&(name, index))?;
	registry.devices.get(id).cloned()
}

pub fn dev_parent_get(device: &Device) -> Option<Arc<Device>> {
	dev_get(device.parent()?)
}

pub fn dev_api_get(name: &str, index: u32) -> DeviceApi {
	dev_get_by_name(name, index).map_or(DeviceApi::None, |dev| dev.api())
}

/// Register a driver. Does not initialize it.
pub fn drv_add(driver: Arc<dyn Driver>) {
	debug!("Registering driver {}", driver.name());
	REGISTRY.lock().drivers.insert(driver.name(), driver);
}

/// Initialize a previously registered driver.
pub fn drv_init(name: &str) -> Result<(), ()> {
	let driver = REGISTRY.lock().drivers.get(name).cloned().ok_or(())?;
	driver.init()
}

pub fn drv_data_set<T: Any + Send>(name: &'static str, data: T) {
	REGISTRY.lock().driver_data.insert(name, Box::new(data));
}

pub fn drv_data_with<T: Any + Send, R>(name: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
	let mut registry = REGISTRY.lock();
	registry.driver_data.get_mut(name)?.downcast_mut::<T>().map(f)
}

/// Devices whose API matches the given kind, e.g. every registered CPU.
pub fn dev_by_type(kind: &str) -> alloc::vec::Vec<Arc<Device>> {
	REGISTRY
		.lock()
		.devices
		.values()
		.filter(|dev| dev.type_matches(kind))
		.cloned()
		.collect()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn register_and_lookup() {
		let id = dev_add(Device::new("test-uart", 7));
		let dev = dev_get(id).unwrap();
		assert_eq!(dev.name(), "test-uart");
		assert_eq!(dev.index(), 7);

		let by_name = dev_get_by_name("test-uart", 7).unwrap();
		assert_eq!(by_name.index(), 7);
		assert!(dev_get_by_name("test-uart", 8).is_none());
	}

	#[test]
	fn device_data_roundtrip() {
		let dev = Device::new("test-dev", 0);
		dev.set_data(42_u32);
		assert_eq!(dev.with_data(|value: &mut u32| *value), Some(42));
		assert_eq!(dev.with_data(|value: &mut u64| *value), None);
	}

	#[test]
	fn parent_links() {
		let parent = dev_add(Device::new("test-bus", 0));
		let child_id = dev_add(Device::new("test-child", 0).with_parent(parent));
		let child = dev_get(child_id).unwrap();
		let resolved = dev_parent_get(&child).unwrap();
		assert_eq!(resolved.name(), "test-bus");
	}
}
