//! Comm-password challenge.

/// Tick byte mixed into the challenge by stock firmware.
pub const DEFAULT_TICKS: u8 = 50;

/// Build the 4-byte `Auth` payload from the numeric comm password and the
/// session id the device handed out on `Connect`.
pub fn make_commkey(password: u32, session_id: u16, ticks: u8) -> [u8; 4] {
    let k = password.reverse_bits().wrapping_add(u32::from(session_id));
    let b = k.to_le_bytes();
    let x = [b[0] ^ b'Z', b[1] ^ b'K', b[2] ^ b'S', b[3] ^ b'O'];
    // Swap the two 16-bit halves.
    let s = [x[2], x[3], x[0], x[1]];
    [s[0] ^ ticks, s[1] ^ ticks, ticks, s[3] ^ ticks]
}
