//! QR code rendering for pairing a new session.

use std::io::{stdout, Write};

use anyhow::{Context, Result};
use crossterm::style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor};
use crossterm::{cursor, execute, terminal};
use qrcode::QrCode;

/// Modules of light border around the code
const QUIET_ZONE: usize = 2;

/// Rows of half-block glyphs, two QR rows per text row, quiet zone included.
///
/// `▀` is dark on top, `▄` dark at the bottom, `█` both, space neither.
pub fn qr_rows(data: &str) -> Result<Vec<String>> {
    let code = QrCode::new(data.as_bytes()).context("Failed to generate QR code")?;
    let size = code.width();
    let modules = code.to_colors();
    let total = size + 2 * QUIET_ZONE;

    let dark = |x: usize, y: usize| -> bool {
        x >= QUIET_ZONE
            && y >= QUIET_ZONE
            && x < size + QUIET_ZONE
            && y < size + QUIET_ZONE
            && modules[(y - QUIET_ZONE) * size + (x - QUIET_ZONE)] == qrcode::Color::Dark
    };

    Ok((0..total)
        .step_by(2)
        .map(|y| {
            (0..total)
                .map(|x| match (dark(x, y), dark(x, y + 1)) {
                    (true, true) => '█',
                    (true, false) => '▀',
                    (false, true) => '▄',
                    (false, false) => ' ',
                })
                .collect()
        })
        .collect())
}

/// Clear the screen and draw the pairing code, centred
pub fn render_qr_code(data: &str) -> Result<()> {
    let rows = qr_rows(data)?;
    let width = rows.first().map(|r| r.chars().count()).unwrap_or(0);
    let term_width = terminal::size().map(|(w, _)| w as usize).unwrap_or(80);
    let pad = " ".repeat(term_width.saturating_sub(width) / 2);

    let mut out = stdout();
    execute!(
        out,
        terminal::Clear(terminal::ClearType::All),
        cursor::MoveTo(0, 0)
    )?;
    println!("\n  Link this device: WhatsApp > Settings > Linked Devices > Link a Device\n");

    for row in rows {
        execute!(
            out,
            Print(&pad),
            SetForegroundColor(Color::Black),
            SetBackgroundColor(Color::White),
            Print(row),
            ResetColor,
            Print("\n")
        )?;
    }
    println!();
    out.flush()?;
    Ok(())
}

pub fn clear_qr_display() -> Result<()> {
    execute!(
        stdout(),
        terminal::Clear(terminal::ClearType::All),
        cursor::MoveTo(0, 0)
    )?;
    Ok(())
}
