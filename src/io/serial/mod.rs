// src/io/serial/mod.rs
//
// Serial port transport.
//
// Features:
// - Port enumeration and VID/PID/path based selection
// - Line configuration (baud, data/stop bits, parity, flow control)
// - Concurrent read and write through separate port handles
// - Unplug detection by polling the port list

pub mod transport;
pub(crate) mod utils;

pub use transport::{list_serial_ports, select_port, SerialPortInfo, SerialProvider, SerialTransport};
pub use utils::{parse_flow_control, parse_parity, FlowControl, Parity, SerialConfig};
