use hermit_sync::{InterruptTicketMutex, Lazy};
use uart_16550::SerialPort;

const SERIAL_IO_PORT: u16 = 0x3F8;

static COM1: Lazy<InterruptTicketMutex<SerialPort>> = Lazy::new(|| {
	let mut port = unsafe { SerialPort::new(SERIAL_IO_PORT) };
	port.init();
	InterruptTicketMutex::new(port)
});

pub fn init() {
	Lazy::force(&COM1);
}

pub fn output(buf: &[u8]) {
	let mut port = COM1.lock();
	for byte in buf {
		port.send(*byte);
	}
}
