//! Deterministic identifier colors for indexed payloads.

/// Map an identifier to a stable RGB color in `[0, 1]`.
///
/// Indexed payloads carry no per-quad color, so viewers derive one from the
/// id. Hashing keeps a quad's color stable across re-renders and sessions
/// without a shared palette table.
pub fn color_for_id(id: &str) -> [f32; 3] {
    let hue = (fnv1a(id.as_bytes()) % 360) as f32 / 360.0;
    hsl_to_rgb(hue, 0.65, 0.52)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> [f32; 3] {
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let hp = h * 6.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (x, 0.0, c),
        4 => (0.0, x, c),
        _ => (c, 0.0, x),
    };
    let m = l - c / 2.0;
    [r + m, g + m, b + m]
}
