//! Reply splitting for paced, multi-message delivery.

/// Turns literal `\n` escape sequences into real newlines.
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\\n", "\n")
}

/// Splits a reply into at most `parts` chunks, by line when the text has at
/// least `parts` newlines, otherwise by sentence.
pub fn smart_split(text: &str, parts: usize) -> Vec<String> {
    let parts = parts.max(1);
    let text = normalize_newlines(text);
    if text.matches('\n').count() >= parts {
        split_by_lines(&text, parts)
    } else {
        split_by_sentences(&text, parts)
    }
}

/// Sizes of `parts` contiguous groups over `len` items; the first
/// `len % parts` groups take one extra item.
fn group_sizes(len: usize, parts: usize) -> impl Iterator<Item = usize> {
    let base = len / parts;
    let remainder = len % parts;
    (0..parts).map(move |i| base + usize::from(i < remainder))
}

fn split_by_lines(text: &str, parts: usize) -> Vec<String> {
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() <= parts {
        return lines
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
    }

    let mut chunks = Vec::with_capacity(parts);
    let mut start = 0;
    for size in group_sizes(lines.len(), parts) {
        let end = start + size;
        let chunk = lines[start..end].join("\n").trim().to_string();
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
        start = end;
    }
    chunks
}

fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | '\n') {
            let sentence = current.trim();
            if !sentence.is_empty() {
                out.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

fn split_by_sentences(text: &str, parts: usize) -> Vec<String> {
    let sentences = sentences(text);
    if sentences.is_empty() {
        return vec![text.to_string()];
    }
    if sentences.len() <= parts {
        return sentences;
    }

    let mut chunks = Vec::with_capacity(parts);
    let mut start = 0;
    for size in group_sizes(sentences.len(), parts) {
        let end = start + size;
        let chunk = sentences[start..end].join(" ").trim().to_string();
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
        start = end;
    }
    chunks
}
