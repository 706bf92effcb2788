//! In-place picture transforms applied on the grab path, before a chunk
//! enters the encoder queue. All pictures are 32-bit BGRA.

const BYTES_PER_PIXEL: usize = 4;

/// Mirror the picture top to bottom.
pub fn flip_vertical(buf: &mut [u8], width: u32, height: u32) {
    let row = width as usize * BYTES_PER_PIXEL;
    let height = height as usize;
    if row == 0 || buf.len() < row * height {
        return;
    }
    let mut scratch = vec![0u8; row];
    for y in 0..height / 2 {
        let top = y * row;
        let bottom = (height - 1 - y) * row;
        scratch.copy_from_slice(&buf[top..top + row]);
        buf.copy_within(bottom..bottom + row, top);
        buf[bottom..bottom + row].copy_from_slice(&scratch);
    }
}

/// Mirror the picture left to right.
pub fn flip_horizontal(buf: &mut [u8], width: u32, height: u32) {
    let width = width as usize;
    let height = height as usize;
    if width == 0 || buf.len() < width * height * BYTES_PER_PIXEL {
        return;
    }
    for y in 0..height {
        let row = y * width;
        for x in 0..width / 2 {
            let a = (row + x) * BYTES_PER_PIXEL;
            let b = (row + width - 1 - x) * BYTES_PER_PIXEL;
            for i in 0..BYTES_PER_PIXEL {
                buf.swap(a + i, b + i);
            }
        }
    }
}

const MARKER_W: usize = 8;
const MARKER_H: usize = 16;

// pointer glyph; 0 transparent, 1 dark outline, 2 light fill
const MARKER: [[u8; MARKER_W]; MARKER_H] = [
    [1, 0, 0, 0, 0, 0, 0, 0],
    [1, 1, 0, 0, 0, 0, 0, 0],
    [1, 2, 1, 0, 0, 0, 0, 0],
    [1, 2, 2, 1, 0, 0, 0, 0],
    [1, 2, 2, 2, 1, 0, 0, 0],
    [1, 2, 2, 2, 2, 1, 0, 0],
    [1, 2, 2, 2, 2, 2, 1, 0],
    [1, 2, 2, 2, 2, 2, 2, 1],
    [1, 2, 2, 2, 2, 1, 1, 1],
    [1, 2, 1, 1, 2, 2, 1, 0],
    [1, 1, 0, 1, 2, 2, 1, 0],
    [0, 0, 0, 0, 1, 2, 2, 1],
    [0, 0, 0, 0, 1, 2, 2, 1],
    [0, 0, 0, 0, 0, 1, 1, 0],
    [0, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 0, 0, 0, 0, 0, 0],
];

/// Burn the pointer marker into the picture. Position is given in percent
/// of the picture dimensions; the glyph scales with the picture so it
/// keeps a constant apparent size across resolutions.
pub fn draw_marker(buf: &mut [u8], width: u32, height: u32, x_percent: f32, y_percent: f32) {
    if width == 0 || height == 0 {
        return;
    }
    let scale_x = (width / 400 + 1) as usize;
    let scale_y = (height / 400 + 1) as usize;
    let base_x = (f64::from(width) * f64::from(x_percent) / 100.0) as usize;
    let base_y = (f64::from(height) * f64::from(y_percent) / 100.0) as usize;

    for (row, cells) in MARKER.iter().enumerate() {
        for (col, &cell) in cells.iter().enumerate() {
            if cell == 0 {
                continue;
            }
            let value = if cell == 1 { 0x00 } else { 0xff };
            for dy in 0..scale_y {
                for dx in 0..scale_x {
                    set_pixel(
                        buf,
                        width,
                        height,
                        base_x + col * scale_x + dx,
                        base_y + row * scale_y + dy,
                        value,
                    );
                }
            }
        }
    }
}

fn set_pixel(buf: &mut [u8], width: u32, height: u32, x: usize, y: usize, value: u8) {
    if x >= width as usize || y >= height as usize {
        return;
    }
    let idx = (y * width as usize + x) * BYTES_PER_PIXEL;
    // the picture itself may be shorter than its nominal geometry
    if idx + BYTES_PER_PIXEL > buf.len() {
        return;
    }
    buf[idx] = value;
    buf[idx + 1] = value;
    buf[idx + 2] = value;
}
