use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

/// A titled block of CLI output, built line by line and printed at once.
pub struct GuideSection {
    title: String,
    lines: Vec<String>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(format!("  {}", text));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(String::new());
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(format!("  {} {}: {}", GEAR, style(label).bold().cyan(), value));
        self
    }

    pub fn info(mut self, msg: &str) -> Self {
        self.lines.push(format!("  {} {}", INFO_ICON, msg));
        self
    }

    pub fn warn(mut self, msg: &str) -> Self {
        self.lines
            .push(format!("  {} {}", WARN_ICON, style(msg).yellow()));
        self
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.lines.push(format!(
            "  {:<28} {}",
            style(name).green().bold(),
            style(description).dim()
        ));
        self
    }

    pub fn render(&self) -> String {
        let mut out = format!("\n{} {}\n", SPARKLE, style(&self.title).bold().underlined());
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn print(self) {
        print!("{}", self.render());
    }
}

pub fn print_banner() {
    let lines: &[&str] = &[
        "       _           _                _             ",
        "   ___| |__   __ _| |_ _ __ ___| | __ _ _   _ ",
        "  / __| '_ \\ / _` | __| '__/ _ \\ |/ _` | | | |",
        " | (__| | | | (_| | |_| | |  __/ | (_| | |_| |",
        "  \\___|_| |_|\\__,_|\\__|_|  \\___|_|\\__,_|\\__, |",
        "                                        |___/ ",
    ];

    // Gradient: #818cf8 -> #22d3ee, left to right
    let from: (u8, u8, u8) = (129, 140, 248);
    let to: (u8, u8, u8) = (34, 211, 238);
    let max_w = lines.iter().map(|l| l.len()).max().unwrap_or(1) as u32;

    println!();
    for line in lines {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let (r, g, b) = lerp_color(from, to, (x as u32 * 1000 / max_w).min(1000));
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");

    println!("\x1b[38;2;34;211;238mYour agents, in your chats.\x1b[0m\n");
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let r = (a.0 as u32 * (1000 - t) + b.0 as u32 * t) / 1000;
    let g = (a.1 as u32 * (1000 - t) + b.1 as u32 * t) / 1000;
    let b_val = (a.2 as u32 * (1000 - t) + b.2 as u32 * t) / 1000;
    (r as u8, g as u8, b_val as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_renders_title_and_lines_in_order() {
        console::set_colors_enabled(false);
        let out = GuideSection::new("Status")
            .text("first")
            .blank()
            .text("second")
            .render();
        let first = out.find("first").unwrap();
        let second = out.find("second").unwrap();
        assert!(out.contains("Status"));
        assert!(first < second);
    }

    #[test]
    fn lerp_endpoints() {
        assert_eq!(lerp_color((0, 0, 0), (200, 100, 50), 0), (0, 0, 0));
        assert_eq!(lerp_color((0, 0, 0), (200, 100, 50), 1000), (200, 100, 50));
    }
}
