//! One-line echo of live messages and status output.

use std::io::stdout;

use chrono::{DateTime, Utc};
use crossterm::execute;
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};

use crate::storage::MediaInfo;

/// What the terminal shows for one live message
#[derive(Debug, Clone)]
pub struct LiveMessage<'a> {
    pub timestamp: DateTime<Utc>,
    pub sender: &'a str,
    pub chat_name: &'a str,
    pub content: &'a str,
    pub is_from_me: bool,
    pub media: &'a MediaInfo,
}

impl LiveMessage<'_> {
    fn arrow(&self) -> &'static str {
        if self.is_from_me {
            "→"
        } else {
            "←"
        }
    }

    /// Direct chats show the sender, groups show "sender @ group"
    fn who(&self) -> String {
        if self.chat_name.is_empty() || self.chat_name == self.sender {
            self.sender.to_string()
        } else {
            format!("{} @ {}", self.sender, self.chat_name)
        }
    }

    fn media_tag(&self) -> Option<String> {
        self.media
            .media_type
            .map(|t| format!("[{}: {}]", t.as_str(), self.media.filename))
    }

    /// Plain rendering, used for logs and tests
    pub fn line(&self) -> String {
        let mut line = format!(
            "[{}] {} {}: ",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.arrow(),
            self.who()
        );
        if let Some(tag) = self.media_tag() {
            line.push_str(&tag);
            if !self.content.is_empty() {
                line.push(' ');
            }
        }
        line.push_str(self.content);
        line
    }
}

pub fn print_live_message(msg: &LiveMessage<'_>) {
    let sender_color = if msg.is_from_me {
        Color::Blue
    } else {
        Color::Cyan
    };
    let mut out = stdout();
    let _ = execute!(
        out,
        SetForegroundColor(Color::DarkGrey),
        Print(format!("[{}] ", msg.timestamp.format("%Y-%m-%d %H:%M:%S"))),
        SetForegroundColor(sender_color),
        Print(format!("{} {}: ", msg.arrow(), msg.who())),
        SetForegroundColor(Color::Yellow),
        Print(msg.media_tag().map(|t| t + " ").unwrap_or_default()),
        ResetColor,
        Print(msg.content)
    );
    println!();
}

pub fn print_connected(phone: &str, name: &str) {
    let _ = execute!(
        stdout(),
        SetForegroundColor(Color::Green),
        SetAttribute(Attribute::Bold),
        Print("✓ Connected to WhatsApp"),
        SetAttribute(Attribute::Reset),
        ResetColor
    );
    println!(" as {} ({})", name, phone);
    println!("Recording messages...");
}

fn print_tagged(color: Color, tag: &str, message: &str) {
    let _ = execute!(
        stdout(),
        SetForegroundColor(color),
        Print(tag),
        Print(message),
        ResetColor
    );
    println!();
}

pub fn print_error(message: &str) {
    print_tagged(Color::Red, "✗ Error: ", message);
}

pub fn print_warning(message: &str) {
    print_tagged(Color::Yellow, "⚠ ", message);
}

pub fn print_info(message: &str) {
    print_tagged(Color::Cyan, "ℹ ", message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MediaType;
    use chrono::TimeZone;

    #[test]
    fn test_live_line() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 19, 18, 30, 5).unwrap();
        let none = MediaInfo::default();
        let msg = LiveMessage {
            timestamp: ts,
            sender: "Alice",
            chat_name: "Alice",
            content: "hi there",
            is_from_me: false,
            media: &none,
        };
        assert_eq!(msg.line(), "[2024-01-19 18:30:05] ← Alice: hi there");

        let photo = MediaInfo {
            media_type: Some(MediaType::Image),
            filename: "image_20240119_183005.jpg".to_string(),
            ..Default::default()
        };
        let msg = LiveMessage {
            sender: "Me",
            chat_name: "Hiking",
            content: "",
            is_from_me: true,
            media: &photo,
            ..msg
        };
        assert_eq!(
            msg.line(),
            "[2024-01-19 18:30:05] → Me @ Hiking: [image: image_20240119_183005.jpg]"
        );
    }
}
