use std::fmt::Write;

/// Render a byte slice in the classic xxd layout: offset column, sixteen
/// hex bytes split into two groups, and the printable-ASCII gutter.
/// Protocol handlers dump all traffic through this at debug level.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();

    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", row * 16);

        for col in 0..16 {
            match chunk.get(col) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
            if col == 7 {
                out.push(' ');
            }
        }

        out.push(' ');
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }

    out
}
