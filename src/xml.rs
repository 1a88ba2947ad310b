//! Minimal XML scanning for the object store's response bodies.
//! Extraction is top-level only: a tag is found when it is a direct child
//! of the element being scanned, never somewhere deeper. Enough for
//! `<UploadId>`, `<ETag>`, and the repeated `<Part>` blocks of ListParts.

/// Inner text of the document's root element, with any XML declaration
/// and leading comments skipped.
pub fn root_inner(body: &str) -> Option<&str> {
    first_element(body).map(|(_, inner)| inner)
}

/// First direct child named `tag` of the document root.
pub fn top_level_tag<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    child(root_inner(body)?, tag)
}

/// All direct children named `tag` of the document root, in order.
pub fn top_level_tags<'a>(body: &'a str, tag: &str) -> Vec<&'a str> {
    root_inner(body).map(|inner| children(inner, tag)).unwrap_or_default()
}

/// First direct child named `tag` of an element fragment.
pub fn child<'a>(fragment: &'a str, tag: &str) -> Option<&'a str> {
    let mut found = None;
    scan_children(fragment, &mut |name, inner| {
        if name == tag && found.is_none() {
            found = Some(inner);
            false
        } else {
            found.is_none()
        }
    });
    found
}

/// All direct children named `tag` of an element fragment.
pub fn children<'a>(fragment: &'a str, tag: &str) -> Vec<&'a str> {
    let mut out = Vec::new();
    scan_children(fragment, &mut |name, inner| {
        if name == tag {
            out.push(inner);
        }
        true
    });
    out
}

/// Decode the entities the store emits in text content.
pub fn unescape_entities(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Escape text for embedding in a request body element.
pub fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn first_element(body: &str) -> Option<(&str, &str)> {
    let mut found = None;
    scan_children(body, &mut |name, inner| {
        found = Some((name, inner));
        false
    });
    found
}

/// Walk the direct child elements of `fragment`, calling `visit` with each
/// child's name and inner text. `visit` returns false to stop early.
/// Declarations and comments are skipped; nesting below the children is
/// passed over without inspection. Malformed input ends the walk.
fn scan_children<'a>(fragment: &'a str, visit: &mut dyn FnMut(&'a str, &'a str) -> bool) {
    let mut pos = 0;
    while let Some(lt) = fragment[pos..].find('<') {
        let start = pos + lt;
        let rest = &fragment[start..];
        if let Some(skip) = skip_non_element(rest) {
            pos = start + skip;
            continue;
        }
        if rest.starts_with("</") {
            // Stray close at this level; step past it.
            match rest.find('>') {
                Some(gt) => {
                    pos = start + gt + 1;
                    continue;
                }
                None => return,
            }
        }
        let Some(gt) = rest.find('>') else { return };
        let tag_body = &rest[1..gt];
        let self_closing = tag_body.ends_with('/');
        let name = tag_body
            .trim_end_matches('/')
            .split_whitespace()
            .next()
            .unwrap_or("");
        if self_closing {
            if !visit(name, "") {
                return;
            }
            pos = start + gt + 1;
            continue;
        }
        let content_start = start + gt + 1;
        let Some((content_end, after)) = find_matching_close(fragment, content_start) else {
            return;
        };
        if !visit(name, &fragment[content_start..content_end]) {
            return;
        }
        pos = after;
    }
}

/// Returns the offset just past a declaration/comment starting at `rest`,
/// or `None` when `rest` starts an element.
fn skip_non_element(rest: &str) -> Option<usize> {
    if rest.starts_with("<?") {
        return rest.find("?>").map(|end| end + 2);
    }
    if rest.starts_with("<!--") {
        return rest.find("-->").map(|end| end + 3);
    }
    None
}

/// Starting inside an element at `from`, find the close tag that returns
/// the scanner to this element's level. Returns (content_end, resume_pos).
fn find_matching_close(fragment: &str, from: usize) -> Option<(usize, usize)> {
    let mut depth = 1usize;
    let mut cursor = from;
    while depth > 0 {
        let lt = fragment[cursor..].find('<')?;
        let at = cursor + lt;
        let rest = &fragment[at..];
        if let Some(skip) = skip_non_element(rest) {
            cursor = at + skip;
            continue;
        }
        let gt = rest.find('>')?;
        if rest.starts_with("</") {
            depth -= 1;
            if depth == 0 {
                return Some((at, at + gt + 1));
            }
        } else if !rest[1..gt].ends_with('/') {
            depth += 1;
        }
        cursor = at + gt + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_PARTS: &str = concat!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
        "<ListPartsResult xmlns=\"http://example.com/doc/2006-03-01/\">\n",
        "  <Bucket>b</Bucket>\n",
        "  <IsTruncated>true</IsTruncated>\n",
        "  <NextPartNumberMarker>2</NextPartNumberMarker>\n",
        "  <Part><PartNumber>1</PartNumber><ETag>\"e1\"</ETag><Size>8388608</Size></Part>\n",
        "  <Part><PartNumber>2</PartNumber><ETag>\"e2\"</ETag><Size>8388608</Size></Part>\n",
        "</ListPartsResult>",
    );

    #[test]
    fn test_top_level_tag() {
        assert_eq!(top_level_tag(LIST_PARTS, "IsTruncated"), Some("true"));
        assert_eq!(top_level_tag(LIST_PARTS, "NextPartNumberMarker"), Some("2"));
        assert_eq!(top_level_tag(LIST_PARTS, "Missing"), None);
    }

    #[test]
    fn test_top_level_only_never_descends() {
        // PartNumber exists only inside <Part>, so a top-level search misses it.
        assert_eq!(top_level_tag(LIST_PARTS, "PartNumber"), None);
    }

    #[test]
    fn test_repeated_children_and_nested_fields() {
        let parts = top_level_tags(LIST_PARTS, "Part");
        assert_eq!(parts.len(), 2);
        assert_eq!(child(parts[0], "PartNumber"), Some("1"));
        assert_eq!(child(parts[1], "ETag"), Some("\"e2\""));
    }

    #[test]
    fn test_upload_id_extraction() {
        let body = "<InitiateMultipartUploadResult><Bucket>b</Bucket><Key>k</Key>\
                    <UploadId>abc-123</UploadId></InitiateMultipartUploadResult>";
        assert_eq!(top_level_tag(body, "UploadId"), Some("abc-123"));
    }

    #[test]
    fn test_self_closing_and_comments() {
        let body = "<!-- note --><Root><Empty/><Value>7</Value></Root>";
        assert_eq!(top_level_tag(body, "Empty"), Some(""));
        assert_eq!(top_level_tag(body, "Value"), Some("7"));
    }

    #[test]
    fn test_malformed_yields_nothing() {
        assert_eq!(top_level_tag("<Root><Open></Root", "Open"), None);
        assert_eq!(top_level_tag("no xml here", "Tag"), None);
    }

    #[test]
    fn test_entity_round_trip() {
        assert_eq!(unescape_entities("&quot;etag&quot;"), "\"etag\"");
        assert_eq!(escape_text("a<b&\"c\""), "a&lt;b&amp;&quot;c&quot;");
        assert_eq!(unescape_entities(&escape_text("x<>&\"y")), "x<>&\"y");
    }
}
