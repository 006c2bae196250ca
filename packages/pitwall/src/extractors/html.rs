//! Header-driven HTML table reading.
//!
//! Sources publish their data as tables whose column order drifts between
//! seasons and pages, so columns are located by header text. Tables are parsed
//! eagerly into owned rows; the `scraper` DOM is not `Send` and never leaves
//! this module.

use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use url::Url;

use crate::error::ExtractError;

static RE_FOOTNOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]").expect("footnote pattern"));
static RE_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

/// One table cell: visible text plus the first link inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    pub text: String,
    pub href: Option<String>,
}

impl Cell {
    /// Text, or `None` when blank or a placeholder dash.
    pub fn value(&self) -> Option<&str> {
        match self.text.as_str() {
            "" | "-" | "–" | "—" | "N/A" => None,
            text => Some(text),
        }
    }
}

/// A data row. `item` is the row's position among data rows, separators
/// included, so item indices stay stable when rows are skipped.
#[derive(Debug, Clone)]
pub struct Row {
    pub item: usize,
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn cell(&self, column: usize) -> Option<&Cell> {
        self.cells.get(column)
    }

    pub fn value(&self, column: Option<usize>) -> Option<&str> {
        column.and_then(|c| self.cells.get(c)).and_then(Cell::value)
    }

    pub fn owned(&self, column: Option<usize>) -> Option<String> {
        self.value(column).map(str::to_string)
    }
}

/// Outcome of reading one `<tr>`.
#[derive(Debug, Clone)]
pub enum RowRead {
    Data(Row),
    /// Cell count did not match the header
    Malformed { item: usize, found: usize, expected: usize },
}

#[derive(Debug, Clone)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<RowRead>,
}

impl Table {
    /// Index of the first column whose header matches one of `keywords`.
    ///
    /// Exact (case-insensitive) matches are preferred over substring matches,
    /// so `"Pos"` does not pick up a `"Position change"` column ahead of `"Pos"`.
    pub fn column(&self, keywords: &[&str]) -> Option<usize> {
        let headers: Vec<String> = self.headers.iter().map(|h| h.to_lowercase()).collect();
        for keyword in keywords {
            let keyword = keyword.to_lowercase();
            if let Some(i) = headers.iter().position(|h| *h == keyword) {
                return Some(i);
            }
        }
        for keyword in keywords {
            let keyword = keyword.to_lowercase();
            if let Some(i) = headers.iter().position(|h| h.contains(&keyword)) {
                return Some(i);
            }
        }
        None
    }

    /// Like `column`, but a missing column is a page-level error.
    pub fn require(&self, keywords: &[&str], origin: &str) -> Result<usize, ExtractError> {
        self.column(keywords)
            .ok_or_else(|| ExtractError::missing(origin, format!("`{}` column", keywords[0])))
    }
}

/// Find the first table matching `selector` whose header row mentions every
/// entry of `required` (substring, case-insensitive).
pub fn find_table(html: &str, selector: &str, required: &[&str]) -> Option<Table> {
    let document = Html::parse_document(html);
    let table_selector = Selector::parse(selector).ok()?;
    let row_selector = Selector::parse("tr").ok()?;

    document.select(&table_selector).find_map(|table| {
        let parsed = read_table(table, &row_selector)?;
        let lower: Vec<String> = parsed.headers.iter().map(|h| h.to_lowercase()).collect();
        let has_all = required
            .iter()
            .all(|r| lower.iter().any(|h| h.contains(&r.to_lowercase())));
        has_all.then_some(parsed)
    })
}

/// All links in the document, resolved against `base`, with their text.
pub fn links(html: &str, base: &str) -> Vec<(String, String)> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            let url = resolve(base, href)?;
            Some((url, clean_text(&visible_text(a))))
        })
        .collect()
}

/// Resolve `href` against `base`. Fragment-only and non-http links are dropped.
pub fn resolve(base: &str, href: &str) -> Option<String> {
    if href.starts_with('#') {
        return None;
    }
    let base = Url::parse(base).ok()?;
    let url = base.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Strip footnote markers and collapse whitespace.
pub fn clean_text(text: &str) -> String {
    let without_notes = RE_FOOTNOTE.replace_all(text, " ");
    RE_WHITESPACE
        .replace_all(&without_notes, " ")
        .trim()
        .to_string()
}

/// Split a trailing three-letter driver code off a name cell
/// (`"Max Verstappen VER"` -> `("Max Verstappen", Some("VER"))`).
pub fn split_driver_code(text: &str) -> (String, Option<String>) {
    let text = text.trim();
    if let Some((name, code)) = text.rsplit_once(' ') {
        let is_code = code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase());
        if is_code && !name.trim().is_empty() {
            return (name.trim().to_string(), Some(code.to_string()));
        }
    }
    (text.to_string(), None)
}

fn read_table(table: ElementRef<'_>, row_selector: &Selector) -> Option<Table> {
    let mut rows = table
        .select(row_selector)
        .filter(|tr| belongs_to(tr, &table));

    let header_row = rows.by_ref().find(|tr| row_cells(tr).iter().any(|c| is_header(c)))?;
    let headers: Vec<String> = expand_spans(&row_cells(&header_row), &mut Vec::new())
        .into_iter()
        .map(|c| c.text)
        .collect();
    if headers.is_empty() {
        return None;
    }

    let mut pending: Vec<Option<(Cell, usize)>> = Vec::new();
    let mut reads = Vec::new();
    for (item, tr) in rows.enumerate() {
        let raw = row_cells(&tr);
        if raw.is_empty() {
            continue;
        }
        // full-width separator rows ("Race cancelled", season dividers)
        if raw.len() == 1 && headers.len() > 1 && span(&raw[0], "colspan") > 1 {
            continue;
        }
        let cells = expand_spans(&raw, &mut pending);
        if cells.len() == headers.len() {
            reads.push(RowRead::Data(Row { item, cells }));
        } else {
            reads.push(RowRead::Malformed {
                item,
                found: cells.len(),
                expected: headers.len(),
            });
        }
    }

    Some(Table {
        headers,
        rows: reads,
    })
}

/// Skip rows of tables nested inside this one.
fn belongs_to(tr: &ElementRef<'_>, table: &ElementRef<'_>) -> bool {
    tr.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().name() == "table")
        .map(|a| a.id() == table.id())
        .unwrap_or(false)
}

fn row_cells<'a>(tr: &ElementRef<'a>) -> Vec<ElementRef<'a>> {
    tr.children()
        .filter_map(ElementRef::wrap)
        .filter(|e| matches!(e.value().name(), "td" | "th"))
        .collect()
}

fn is_header(cell: &ElementRef<'_>) -> bool {
    cell.value().name() == "th"
}

fn span(cell: &ElementRef<'_>, attr: &str) -> usize {
    cell.value()
        .attr(attr)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1)
        .min(50)
}

/// Expand colspan and carry rowspan cells down into following rows.
///
/// `pending[col]` holds a cell still spanning into the current row and how
/// many more rows it covers.
fn expand_spans(raw: &[ElementRef<'_>], pending: &mut Vec<Option<(Cell, usize)>>) -> Vec<Cell> {
    let mut out = Vec::new();
    for element in raw {
        take_pending(&mut out, pending);
        let cell = read_cell(element);
        let rowspan = span(element, "rowspan");
        for _ in 0..span(element, "colspan") {
            let col = out.len();
            if rowspan > 1 {
                if pending.len() <= col {
                    pending.resize(col + 1, None);
                }
                pending[col] = Some((cell.clone(), rowspan - 1));
            }
            out.push(cell.clone());
        }
    }
    take_pending(&mut out, pending);
    out
}

fn take_pending(out: &mut Vec<Cell>, pending: &mut [Option<(Cell, usize)>]) {
    while let Some(Some((cell, remaining))) = pending.get_mut(out.len()) {
        out.push(cell.clone());
        *remaining -= 1;
        if *remaining == 0 {
            let col = out.len() - 1;
            pending[col] = None;
        }
    }
}

fn read_cell(element: &ElementRef<'_>) -> Cell {
    let href = Selector::parse("a[href]").ok().and_then(|sel| {
        element
            .select(&sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string)
    });
    Cell {
        text: clean_text(&visible_text(*element)),
        href,
    }
}

/// Text a reader would see: skips scripts, styles, hidden sort keys and
/// reference superscripts.
fn visible_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    collect_text(element, &mut out);
    out
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let hidden = matches!(el.name(), "script" | "style" | "sup")
                    || el.classes().any(|c| c == "sortkey" || c == "reference")
                    || el
                        .attr("style")
                        .map(|s| s.replace(' ', "").contains("display:none"))
                        .unwrap_or(false);
                if el.name() == "br" {
                    out.push(' ');
                } else if !hidden {
                    if let Some(child_el) = ElementRef::wrap(child) {
                        // block-ish children (spans in driver cells) need a gap
                        out.push(' ');
                        collect_text(child_el, out);
                        out.push(' ');
                    }
                }
            }
            _ => {}
        }
    }
}
