//! 提示构造与模型输出解析。

use crate::batch::types::{TaskParams, WorkItem};
use sonic_rs::prelude::*;
use std::fmt::Write as _;

/// 单条摘要写进提示的最大字符数。
const MAX_ABSTRACT_CHARS: usize = 2000;

const DRAFT_OPEN: &str = "<<<DRAFT";
const DRAFT_CLOSE: &str = "DRAFT>>>";

/// 模型对一条记录给出的判断。
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDecision {
    pub id: String,
    pub included: bool,
    pub reasoning: String,
    pub confidence: Option<f64>,
}

/// 粗略估计：约 4 个字符一个 token，再加上输出上限。
pub fn estimate_tokens(prompt: &str, max_output_tokens: u32) -> u64 {
    let chars = prompt.chars().count() as u64;
    chars.div_ceil(4) + max_output_tokens as u64
}

fn push_section(out: &mut String, title: &str, body: &str) {
    let body = body.trim();
    if body.is_empty() {
        return;
    }
    let _ = writeln!(out, "{title}:\n{body}\n");
}

fn truncate_chars(s: &str, max: usize) -> String {
    let s = s.trim();
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

fn push_items(out: &mut String, items: &[WorkItem]) {
    for item in items {
        let _ = writeln!(out, "ID: {}", item.id.trim());
        let _ = writeln!(out, "Title: {}", item.title.trim());
        if !item.authors.is_empty() {
            let _ = writeln!(out, "Authors: {}", item.authors.join(", "));
        }
        if let Some(year) = item.year {
            let _ = writeln!(out, "Year: {year}");
        }
        if !item.venue.trim().is_empty() {
            let _ = writeln!(out, "Venue: {}", item.venue.trim());
        }
        if !item.keywords.is_empty() {
            let _ = writeln!(out, "Keywords: {}", item.keywords.join(", "));
        }
        if !item.abstract_text.trim().is_empty() {
            let _ = writeln!(
                out,
                "Abstract: {}",
                truncate_chars(&item.abstract_text, MAX_ABSTRACT_CHARS)
            );
        }
        if let Some(payload) = &item.payload
            && let Ok(s) = sonic_rs::to_string(payload)
        {
            let _ = writeln!(out, "Extra: {s}");
        }
        out.push('\n');
    }
}

pub fn build_screening_prompt(params: &TaskParams, items: &[WorkItem]) -> String {
    let mut out = String::with_capacity(1024 + items.len() * 512);
    out.push_str(
        "You are screening papers for a systematic literature review. \
         Decide for every paper below whether it should be included.\n\n",
    );
    push_section(&mut out, "Research topic", &params.topic);
    push_section(&mut out, "Inclusion criteria", &params.inclusion_criteria);
    push_section(&mut out, "Exclusion criteria", &params.exclusion_criteria);
    push_section(&mut out, "Additional instructions", &params.instructions);
    out.push_str(
        "Respond with ONLY a JSON array containing one object per paper, in any order:\n\
         [{\"id\": \"<paper id>\", \"included\": true, \"reasoning\": \"<one sentence>\", \"confidence\": 0.0}]\n\
         confidence is a number between 0 and 1.\n\n\
         Papers:\n\n",
    );
    push_items(&mut out, items);
    out
}

pub fn build_regeneration_prompt(params: &TaskParams, draft: &str, items: &[WorkItem]) -> String {
    let mut out = String::with_capacity(2048 + draft.len() + items.len() * 512);
    out.push_str(
        "You are iteratively writing a literature review. \
         Revise the current draft so that it incorporates the papers listed below.\n\n",
    );
    push_section(&mut out, "Research topic", &params.topic);
    push_section(&mut out, "Instructions", &params.instructions);

    out.push_str("Current draft:\n");
    out.push_str(DRAFT_OPEN);
    out.push('\n');
    if draft.trim().is_empty() {
        out.push_str("(empty, start a new draft)\n");
    } else {
        out.push_str(draft.trim());
        out.push('\n');
    }
    out.push_str(DRAFT_CLOSE);
    out.push_str("\n\n");

    out.push_str(
        "Return the complete revised draft only, without commentary or code fences. \
         Cite papers by their ID.\n\nPapers:\n\n",
    );
    push_items(&mut out, items);
    out
}

/// 去掉模型有时附带的代码块围栏与草稿标记。
pub fn clean_regenerated_draft(text: &str) -> String {
    let mut s = strip_code_fence(text.trim());
    if let Some(rest) = s.strip_prefix(DRAFT_OPEN) {
        s = rest;
    }
    if let Some(rest) = s.trim_end().strip_suffix(DRAFT_CLOSE) {
        s = rest;
    }
    s.trim().to_string()
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    // 跳过语言标记所在的第一行
    let body = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// 解析筛选结果。接受裸数组、代码块包裹的数组，以及 {"results": [...]} 形式。
pub fn parse_screening_response(text: &str) -> Result<Vec<ParsedDecision>, String> {
    let body = strip_code_fence(text.trim());

    let value: sonic_rs::Value = match sonic_rs::from_str(body) {
        Ok(v) => v,
        Err(_) => {
            let (Some(start), Some(end)) = (body.find('['), body.rfind(']')) else {
                return Err("模型输出中找不到 JSON 数组".to_string());
            };
            if end <= start {
                return Err("模型输出中找不到 JSON 数组".to_string());
            }
            sonic_rs::from_str(&body[start..=end]).map_err(|e| format!("模型输出不是合法 JSON: {e}"))?
        }
    };

    let arr = if let Some(arr) = value.as_array() {
        arr
    } else if let Some(arr) = value
        .as_object()
        .and_then(|o| o.get(&"results").or_else(|| o.get(&"decisions")))
        .and_then(|v| v.as_array())
    {
        arr
    } else {
        return Err("模型输出不是 JSON 数组".to_string());
    };

    let mut out = Vec::new();
    for it in arr.iter() {
        let Some(obj) = it.as_object() else {
            continue;
        };
        let id = match obj.get(&"id") {
            Some(v) if v.is_str() => v.as_str().unwrap_or("").trim().to_string(),
            Some(v) if v.is_number() => v
                .as_i64()
                .map(|n| n.to_string())
                .or_else(|| v.as_f64().map(|f| f.to_string()))
                .unwrap_or_default(),
            _ => String::new(),
        };
        if id.is_empty() {
            continue;
        }

        let Some(included) = obj.get(&"included").and_then(parse_bool) else {
            continue;
        };
        let reasoning = obj
            .get(&"reasoning")
            .or_else(|| obj.get(&"reason"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        let confidence = obj
            .get(&"confidence")
            .and_then(|v| v.as_f64().or_else(|| v.as_i64().map(|n| n as f64)))
            .filter(|c| c.is_finite() && *c >= 0.0)
            .map(|c| if c > 1.0 { c / 100.0 } else { c })
            .map(|c| c.clamp(0.0, 1.0));

        out.push(ParsedDecision {
            id,
            included,
            reasoning,
            confidence,
        });
    }
    Ok(out)
}

fn parse_bool(v: &sonic_rs::Value) -> Option<bool> {
    if let Some(b) = v.as_bool() {
        return Some(b);
    }
    match v.as_str()?.trim().to_lowercase().as_str() {
        "true" | "yes" | "include" | "included" => Some(true),
        "false" | "no" | "exclude" | "excluded" => Some(false),
        _ => None,
    }
}
