/// DMX output for the smoke machine through an ENTTEC Pro compatible USB
/// interface.
///
/// Frame layout: 0x7E, label, length LSB, length MSB, data, 0xE7. The data is
/// the full 512-channel universe with channel 1 in the first byte.

use crate::actuators::SmokeDriver;
use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::time::Duration;

pub const START_OF_MESSAGE: u8 = 0x7E;
pub const END_OF_MESSAGE: u8 = 0xE7;
/// "Output only send DMX packet" request label
pub const SEND_DMX_LABEL: u8 = 0x06;
pub const UNIVERSE_SIZE: usize = 512;

/// Wrap `data` in an ENTTEC Pro message.
pub fn enttec_frame(label: u8, data: &[u8]) -> Vec<u8> {
    let len = data.len();
    let mut frame = Vec::with_capacity(len + 5);
    frame.push(START_OF_MESSAGE);
    frame.push(label);
    frame.push((len & 0xFF) as u8);
    frame.push(((len >> 8) & 0xFF) as u8);
    frame.extend_from_slice(data);
    frame.push(END_OF_MESSAGE);
    frame
}

/// Universe with every channel at 0 except `channel` (1-based).
pub fn universe_with(channel: u16, level: u8) -> Result<Vec<u8>> {
    let index = usize::from(channel)
        .checked_sub(1)
        .filter(|i| *i < UNIVERSE_SIZE)
        .ok_or_else(|| anyhow!("DMX channel {} outside 1..={}", channel, UNIVERSE_SIZE))?;
    let mut universe = vec![0u8; UNIVERSE_SIZE];
    universe[index] = level;
    Ok(universe)
}

pub fn dmx_packet(channel: u16, level: u8) -> Result<Vec<u8>> {
    Ok(enttec_frame(SEND_DMX_LABEL, &universe_with(channel, level)?))
}

struct SerialSink(Box<dyn serialport::SerialPort>);

impl Write for SerialSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

/// Smoke machine on one DMX channel.
pub struct DmxSmoke {
    port: Box<dyn Write + Send>,
    port_path: String,
    channel: u16,
}

impl DmxSmoke {
    pub fn open(port_path: &str, baud: u32, channel: u16) -> Result<Self> {
        universe_with(channel, 0)?;
        let port = serialport::new(port_path, baud)
            .timeout(Duration::from_secs(2))
            .open()
            .with_context(|| format!("DMX interface {} did not open", port_path))?;
        log::info!(target: "dmx", "DMX interface open on {} ({} baud, channel {})", port_path, baud, channel);
        Ok(Self::with_writer(Box::new(SerialSink(port)), port_path, channel))
    }

    /// Use any byte sink in place of the serial port.
    pub fn with_writer(port: Box<dyn Write + Send>, port_path: &str, channel: u16) -> Self {
        Self { port, port_path: port_path.to_string(), channel }
    }
}

impl SmokeDriver for DmxSmoke {
    fn send_level(&mut self, level: u8) -> Result<()> {
        let packet = dmx_packet(self.channel, level)?;
        self.port
            .write_all(&packet)
            .and_then(|_| self.port.flush())
            .map_err(|e| anyhow!("DMX write to {} failed: {}", self.port_path, e))
    }
}
