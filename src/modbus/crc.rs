/// Reflected polynomial of CRC-16/Modbus.
const POLY: u16 = 0xA001;

/// CRC-16/Modbus (init 0xFFFF) over `data`.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, &byte| {
        (0..8).fold(crc ^ byte as u16, |crc, _| {
            if crc & 1 != 0 {
                (crc >> 1) ^ POLY
            } else {
                crc >> 1
            }
        })
    })
}

/// Appends the CRC low byte first, as RTU framing requires.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16_modbus(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Checks the trailing two CRC bytes of a complete frame.
pub fn frame_crc_ok(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    received == crc16_modbus(&frame[..data_len])
}
