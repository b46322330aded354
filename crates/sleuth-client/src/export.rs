//! Report export: markdown to a fixed-width, paginated PDF.
//!
//! The report is flattened to plain text lines, wrapped at [`PAGE_COLUMNS`]
//! and split into A4 pages of [`PAGE_LINES`] lines set in Courier.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use pulldown_cmark::{Event, Options, Parser, Tag};
use tracing::info;

use crate::error::{ClientError, ClientResult};

pub const PAGE_COLUMNS: usize = 80;
pub const PAGE_LINES: usize = 64;

const PAGE_WIDTH_PT: u32 = 595;
const PAGE_HEIGHT_PT: u32 = 842;
const MARGIN_LEFT_PT: u32 = 40;
const MARGIN_TOP_PT: u32 = 40;
const FONT_SIZE_PT: u32 = 10;
const LEADING_PT: u32 = 12;
const FOOTER_Y_PT: u32 = 18;
const FALLBACK_NAME: &str = "local";

/// File name for an exported report, falling back to `local` without an id.
pub fn report_file_name(task_id: Option<&str>) -> String {
    let id = task_id
        .map(|id| {
            id.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                .collect::<String>()
        })
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| FALLBACK_NAME.to_string());
    format!("research-report-{id}.pdf")
}

/// Render `markdown` and write it under `dir`. Returns the written path.
pub fn export_report(dir: &Path, task_id: Option<&str>, markdown: &str) -> ClientResult<PathBuf> {
    if markdown.trim().is_empty() {
        return Err(ClientError::Export {
            message: "report is empty".to_string(),
        });
    }
    std::fs::create_dir_all(dir)?;
    let path = dir.join(report_file_name(task_id));
    let pdf = render_pdf(markdown);
    std::fs::write(&path, &pdf)?;
    info!(path = %path.display(), bytes = pdf.len(), "report exported");
    Ok(path)
}

pub fn render_pdf(markdown: &str) -> Vec<u8> {
    let lines = markdown_to_lines(markdown, PAGE_COLUMNS);
    let pages = paginate(&lines, PAGE_LINES);
    write_pdf(&pages)
}

/// Split lines into pages; always at least one (possibly empty) page.
pub fn paginate(lines: &[String], per_page: usize) -> Vec<Vec<String>> {
    let per_page = per_page.max(1);
    let mut pages: Vec<Vec<String>> = lines.chunks(per_page).map(<[String]>::to_vec).collect();
    if pages.is_empty() {
        pages.push(Vec::new());
    }
    pages
}

#[derive(Debug, Clone)]
enum Block {
    Paragraph,
    Heading(usize),
    Quote,
    List(Option<u64>),
    Item,
    Code,
    Link(String),
    TableHead,
    TableRow,
    TableCell,
    Other,
}

struct Layout {
    width: usize,
    lines: Vec<String>,
    text: String,
    stack: Vec<Block>,
    marker: Option<String>,
    row: Vec<String>,
}

/// Flatten markdown into wrapped plain-text lines.
pub fn markdown_to_lines(markdown: &str, width: usize) -> Vec<String> {
    let mut layout = Layout {
        width: width.max(20),
        lines: Vec::new(),
        text: String::new(),
        stack: Vec::new(),
        marker: None,
        row: Vec::new(),
    };

    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    for event in Parser::new_ext(markdown, options) {
        match event {
            Event::Start(tag) => layout.start(tag),
            Event::End(_) => layout.end(),
            Event::Text(text) => {
                if layout.in_code() {
                    layout.code_text(&text);
                } else {
                    layout.text.push_str(&text);
                }
            }
            Event::Code(code) => layout.text.push_str(&code),
            Event::SoftBreak => layout.text.push(' '),
            Event::HardBreak => layout.flush(false),
            Event::Rule => {
                layout.flush(false);
                let rule = "-".repeat(layout.width);
                layout.lines.push(rule);
                layout.blank();
            }
            Event::TaskListMarker(done) => {
                layout.text.push_str(if done { "[x] " } else { "[ ] " });
            }
            _ => {}
        }
    }
    layout.flush(false);

    while layout.lines.last().is_some_and(|l| l.is_empty()) {
        layout.lines.pop();
    }
    layout.lines
}

impl Layout {
    fn start(&mut self, tag: Tag<'_>) {
        let block = match tag {
            Tag::Paragraph => Block::Paragraph,
            Tag::Heading { level, .. } => {
                self.flush(false);
                Block::Heading(level as usize)
            }
            Tag::BlockQuote(..) => {
                self.flush(false);
                Block::Quote
            }
            Tag::List(start) => {
                self.flush(false);
                Block::List(start)
            }
            Tag::Item => {
                self.flush(false);
                self.marker = Some(self.next_marker());
                Block::Item
            }
            Tag::CodeBlock(_) => {
                self.flush(false);
                Block::Code
            }
            Tag::Link { dest_url, .. } => Block::Link(dest_url.to_string()),
            Tag::TableHead => Block::TableHead,
            Tag::TableRow => Block::TableRow,
            Tag::TableCell => Block::TableCell,
            _ => Block::Other,
        };
        self.stack.push(block);
    }

    fn end(&mut self) {
        let Some(block) = self.stack.pop() else {
            return;
        };
        match block {
            Block::Paragraph => self.flush(!self.in_item()),
            Block::Heading(level) => {
                let heading = self.text.trim().to_string();
                self.flush(false);
                let underline = match level {
                    1 => Some('='),
                    2 => Some('-'),
                    _ => None,
                };
                if let Some(ch) = underline {
                    let len = heading.chars().count().min(self.width);
                    let rule = format!("{}{}", self.prefix(), ch.to_string().repeat(len));
                    self.lines.push(rule);
                }
                self.blank();
            }
            Block::Item => self.flush(false),
            Block::List(_) => {
                if !self.in_item() {
                    self.blank();
                }
            }
            Block::Quote | Block::Code => self.blank(),
            Block::Link(url) => {
                if !url.is_empty() && !self.text.ends_with(url.as_str()) {
                    let _ = write!(self.text, " <{url}>");
                }
            }
            Block::TableCell => {
                let cell = std::mem::take(&mut self.text);
                self.row.push(cell.trim().to_string());
            }
            Block::TableHead => {
                let width = self.emit_row().min(self.width);
                self.lines.push("-".repeat(width));
            }
            Block::TableRow => {
                self.emit_row();
            }
            Block::Other => {
                if self.stack.is_empty() {
                    self.blank();
                }
            }
        }
    }

    fn in_code(&self) -> bool {
        self.stack.iter().any(|b| matches!(b, Block::Code))
    }

    fn in_item(&self) -> bool {
        self.stack.iter().any(|b| matches!(b, Block::Item))
    }

    fn list_depth(&self) -> usize {
        self.stack
            .iter()
            .filter(|b| matches!(b, Block::List(_)))
            .count()
    }

    fn next_marker(&mut self) -> String {
        let Some(Block::List(start)) = self
            .stack
            .iter_mut()
            .rev()
            .find(|b| matches!(b, Block::List(_)))
        else {
            return "- ".to_string();
        };
        match start {
            Some(n) => {
                let marker = format!("{n}. ");
                *n += 1;
                marker
            }
            None => "- ".to_string(),
        }
    }

    /// Quote markers plus list indentation for the current nesting.
    fn prefix(&self) -> String {
        let mut prefix = String::new();
        for block in &self.stack {
            if matches!(block, Block::Quote) {
                prefix.push_str("> ");
            }
        }
        let depth = self.list_depth();
        if depth > 1 {
            prefix.push_str(&"  ".repeat(depth - 1));
        }
        prefix
    }

    fn blank(&mut self) {
        if self.lines.last().is_some_and(|l| !l.is_empty()) {
            self.lines.push(String::new());
        }
    }

    fn flush(&mut self, trailing_blank: bool) {
        let text = std::mem::take(&mut self.text);
        let marker = self.marker.take();
        if text.trim().is_empty() && marker.is_none() {
            return;
        }
        let base = self.prefix();
        let (first, rest) = match marker {
            Some(marker) => {
                let pad = " ".repeat(marker.chars().count());
                (format!("{base}{marker}"), format!("{base}{pad}"))
            }
            None => (base.clone(), base),
        };
        let wrapped = wrap(&text, &first, &rest, self.width);
        self.lines.extend(wrapped);
        if trailing_blank {
            self.blank();
        }
    }

    fn code_text(&mut self, text: &str) {
        let prefix = format!("{}    ", self.prefix());
        let room = self.width.saturating_sub(prefix.chars().count()).max(1);
        for line in text.lines() {
            let chars: Vec<char> = line.chars().collect();
            if chars.is_empty() {
                self.lines.push(prefix.trim_end().to_string());
                continue;
            }
            for chunk in chars.chunks(room) {
                self.lines.push(format!("{prefix}{}", chunk.iter().collect::<String>()));
            }
        }
    }

    fn emit_row(&mut self) -> usize {
        let cells = std::mem::take(&mut self.row);
        let row = cells.join(" | ");
        let prefix = self.prefix();
        let wrapped = wrap(&row, &prefix, &prefix, self.width);
        let widest = wrapped.iter().map(|l| l.chars().count()).max().unwrap_or(0);
        self.lines.extend(wrapped);
        widest
    }
}

/// Greedy word wrap. Words longer than a line are split hard.
fn wrap(text: &str, first_prefix: &str, rest_prefix: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = first_prefix.to_string();
    let mut line_len = first_prefix.chars().count();
    let mut has_word = false;

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        loop {
            let space = usize::from(has_word);
            if line_len + space + word.len() <= width {
                if has_word {
                    line.push(' ');
                }
                line.extend(word.iter());
                line_len += space + word.len();
                has_word = true;
                break;
            }
            if has_word {
                lines.push(std::mem::replace(&mut line, rest_prefix.to_string()));
                line_len = rest_prefix.chars().count();
                has_word = false;
                continue;
            }
            let room = width.saturating_sub(line_len).max(1);
            let tail = word.split_off(room.min(word.len()));
            line.extend(word.iter());
            lines.push(std::mem::replace(&mut line, rest_prefix.to_string()));
            line_len = rest_prefix.chars().count();
            word = tail;
            if word.is_empty() {
                break;
            }
        }
    }
    if has_word || lines.is_empty() {
        lines.push(line.trim_end().to_string());
    }
    lines
}

fn write_pdf(pages: &[Vec<String>]) -> Vec<u8> {
    let page_count = pages.len();
    // Objects: 1 catalog, 2 page tree, 3 font, then (page, content) pairs.
    let object_count = 3 + page_count * 2;
    let mut out: Vec<u8> = Vec::new();
    let mut offsets = vec![0usize; object_count + 1];

    out.extend_from_slice(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n");

    offsets[1] = out.len();
    out.extend_from_slice(b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");

    offsets[2] = out.len();
    let kids = (0..page_count)
        .map(|i| format!("{} 0 R", 4 + i * 2))
        .collect::<Vec<_>>()
        .join(" ");
    out.extend_from_slice(
        format!("2 0 obj\n<< /Type /Pages /Kids [{kids}] /Count {page_count} >>\nendobj\n")
            .as_bytes(),
    );

    offsets[3] = out.len();
    out.extend_from_slice(
        b"3 0 obj\n<< /Type /Font /Subtype /Type1 /BaseFont /Courier /Encoding /WinAnsiEncoding >>\nendobj\n",
    );

    for (index, lines) in pages.iter().enumerate() {
        let page_obj = 4 + index * 2;
        let content_obj = page_obj + 1;

        offsets[page_obj] = out.len();
        out.extend_from_slice(
            format!(
                "{page_obj} 0 obj\n<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {PAGE_WIDTH_PT} {PAGE_HEIGHT_PT}] \
                 /Resources << /Font << /F1 3 0 R >> >> /Contents {content_obj} 0 R >>\nendobj\n"
            )
            .as_bytes(),
        );

        let stream = page_content(lines, index + 1, page_count);
        offsets[content_obj] = out.len();
        out.extend_from_slice(
            format!("{content_obj} 0 obj\n<< /Length {} >>\nstream\n", stream.len()).as_bytes(),
        );
        out.extend_from_slice(&stream);
        out.extend_from_slice(b"\nendstream\nendobj\n");
    }

    let xref_offset = out.len();
    let mut xref = format!("xref\n0 {}\n0000000000 65535 f \n", object_count + 1);
    for offset in offsets.iter().skip(1) {
        let _ = writeln!(xref, "{offset:010} 00000 n ");
    }
    let _ = write!(
        xref,
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n",
        object_count + 1
    );
    out.extend_from_slice(xref.as_bytes());
    out
}

fn page_content(lines: &[String], page: usize, total: usize) -> Vec<u8> {
    let top = PAGE_HEIGHT_PT - MARGIN_TOP_PT;
    let mut stream = Vec::new();
    stream.extend_from_slice(
        format!("BT\n/F1 {FONT_SIZE_PT} Tf\n{LEADING_PT} TL\n{MARGIN_LEFT_PT} {top} Td\n")
            .as_bytes(),
    );
    for line in lines {
        stream.push(b'(');
        stream.extend_from_slice(&pdf_string(line));
        stream.extend_from_slice(b") Tj T*\n");
    }
    stream.extend_from_slice(b"ET\n");

    let footer = format!("Page {page} of {total}");
    stream.extend_from_slice(
        format!("BT\n/F1 8 Tf\n{MARGIN_LEFT_PT} {FOOTER_Y_PT} Td\n(").as_bytes(),
    );
    stream.extend_from_slice(&pdf_string(&footer));
    stream.extend_from_slice(b") Tj\nET");
    stream
}

/// Encode text for a PDF literal string in WinAnsi, escaping delimiters.
fn pdf_string(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' | '(' | ')' => {
                out.push(b'\\');
                out.push(ch as u8);
            }
            ' '..='~' => out.push(ch as u8),
            '\t' => out.push(b' '),
            '\u{A0}'..='\u{FF}' => out.extend_from_slice(format!("\\{:03o}", ch as u32).as_bytes()),
            '\u{2018}' | '\u{2019}' => out.push(b'\''),
            '\u{201C}' | '\u{201D}' => out.push(b'"'),
            '\u{2013}' | '\u{2014}' => out.push(b'-'),
            '\u{2022}' => out.push(b'*'),
            _ => out.push(b'?'),
        }
    }
    out
}
