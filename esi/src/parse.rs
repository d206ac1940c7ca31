use std::borrow::Cow;
use std::collections::HashMap;

/// A span of a document: either literal text or a single ESI tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment<'a> {
    Text(&'a str),
    Tag(RawTag<'a>),
}

/// An ESI tag as found in the source, with its body left unparsed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTag<'a> {
    /// The complete tag markup, from the opening `<` to the final `>`.
    pub raw: &'a str,
    /// The directive name without its namespace, e.g. `include`.
    pub name: &'a str,
    /// Everything between the tag name and the end of the opening tag.
    pub attributes: &'a str,
    /// The content between the opening and closing tags. `None` for self-closing tags.
    pub body: Option<&'a str>,
}

impl RawTag<'_> {
    pub fn attributes(&self) -> Attributes {
        parse_attributes(self.attributes)
    }
}

/// Splits `input` into literal text and the outermost `<namespace:*>` tags.
///
/// Text fragments are always emitted around each tag, even when empty, so a
/// document with `n` tags yields `2n + 1` fragments. Tags nested inside a tag
/// body are left in the body; a nested tag with the same name as its parent
/// is paired with its own closing tag rather than ending the parent early.
/// A start tag without a matching end tag is not an ESI tag and stays text.
pub fn scan<'a>(input: &'a str, namespace: &str) -> Vec<Fragment<'a>> {
    let open = format!("<{namespace}:");
    let mut fragments = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while let Some(offset) = find_ignore_case(&input[cursor..], &open) {
        let start = cursor + offset;
        match read_tag(input, start, open.len(), namespace) {
            Some((tag, end)) => {
                fragments.push(Fragment::Text(&input[text_start..start]));
                fragments.push(Fragment::Tag(tag));
                text_start = end;
                cursor = end;
            }
            None => cursor = start + 1,
        }
    }
    fragments.push(Fragment::Text(&input[text_start..]));

    fragments
}

/// Rewrites `<!--esi ... -->` wrappers into `<esi:vars>...</esi:vars>`.
pub fn rewrite_esi_comments<'a>(input: &'a str, namespace: &str) -> Cow<'a, str> {
    let open = format!("<!--{namespace}");
    let mut output = String::new();
    let mut last = 0;
    let mut cursor = 0;

    while let Some(offset) = find_ignore_case(&input[cursor..], &open) {
        let start = cursor + offset;
        let content_start = start + open.len();
        if is_name_char(input.as_bytes().get(content_start)) {
            cursor = content_start;
            continue;
        }
        let Some(len) = input[content_start..].find("-->") else {
            break;
        };
        output.push_str(&input[last..start]);
        output.push_str(&format!(
            "<{ns}:vars>{}</{ns}:vars>",
            &input[content_start..content_start + len],
            ns = namespace
        ));
        last = content_start + len + 3;
        cursor = last;
    }

    if last == 0 {
        return Cow::Borrowed(input);
    }
    output.push_str(&input[last..]);
    Cow::Owned(output)
}

// Reads the tag starting at `start`, returning it with the index just past its end.
fn read_tag<'a>(
    input: &'a str,
    start: usize,
    prefix_len: usize,
    namespace: &str,
) -> Option<(RawTag<'a>, usize)> {
    let bytes = input.as_bytes();
    let name_start = start + prefix_len;
    let mut name_end = name_start;
    while name_end < bytes.len() && bytes[name_end].is_ascii_alphabetic() {
        name_end += 1;
    }
    if name_end == name_start || is_name_char(bytes.get(name_end)) {
        return None;
    }
    let name = &input[name_start..name_end];

    let open_end = find_tag_end(bytes, name_end)?;
    if open_end > name_end && bytes[open_end - 1] == b'/' {
        let end = open_end + 1;
        return Some((
            RawTag {
                raw: &input[start..end],
                name,
                attributes: &input[name_end..open_end - 1],
                body: None,
            },
            end,
        ));
    }

    let body_start = open_end + 1;
    let (body_end, end) = find_closing_tag(input, body_start, namespace, name)?;
    Some((
        RawTag {
            raw: &input[start..end],
            name,
            attributes: &input[name_end..open_end],
            body: Some(&input[body_start..body_end]),
        },
        end,
    ))
}

// Finds the `>` closing a start tag, skipping over quoted attribute values.
// A quote only starts a value directly after `=`; elsewhere it is a plain character.
fn find_tag_end(bytes: &[u8], from: usize) -> Option<usize> {
    let mut quote = None;
    for (i, &b) in bytes.iter().enumerate().skip(from) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if (b == b'"' || b == b'\'') && i > 0 && bytes[i - 1] == b'=' => {
                quote = Some(b)
            }
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

// Finds the end tag matching an open tag named `name`, tracking nested
// same-named tags. Returns the start of the end tag and the index past it.
fn find_closing_tag(
    input: &str,
    from: usize,
    namespace: &str,
    name: &str,
) -> Option<(usize, usize)> {
    let bytes = input.as_bytes();
    let open = format!("<{namespace}:{name}");
    let close = format!("</{namespace}:{name}");
    let mut depth = 1;
    let mut cursor = from;

    while let Some(offset) = input[cursor..].find('<') {
        let at = cursor + offset;
        let rest = &bytes[at..];
        cursor = at + 1;

        if starts_with_ignore_case(rest, close.as_bytes())
            && !is_name_char(bytes.get(at + close.len()))
        {
            let mut i = at + close.len();
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if bytes.get(i) == Some(&b'>') {
                depth -= 1;
                if depth == 0 {
                    return Some((at, i + 1));
                }
                cursor = i + 1;
            }
        } else if starts_with_ignore_case(rest, open.as_bytes())
            && !is_name_char(bytes.get(at + open.len()))
        {
            if let Some(end) = find_tag_end(bytes, at + open.len()) {
                if bytes[end - 1] != b'/' {
                    depth += 1;
                }
                cursor = end + 1;
            }
        }
    }
    None
}

fn is_name_char(b: Option<&u8>) -> bool {
    matches!(b, Some(b) if b.is_ascii_alphanumeric() || *b == b'_')
}

fn starts_with_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && haystack[..needle.len()].eq_ignore_ascii_case(needle)
}

fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

/// The attributes of a single tag.
///
/// An attribute written without a value (e.g. `ignore`) is present but has no value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    map: HashMap<String, Option<String>>,
}

impl Attributes {
    /// The value of `key`, if the attribute is present and has a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).and_then(|value| value.as_deref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Parses `key`, `key=value`, `key="value"` and `key='value'` pairs.
///
/// Keys start at a word character. Quoted values end at the first matching
/// quote not preceded by a backslash; backslashes are kept as written. A
/// quoted value with no closing quote is read like a bare value, up to the
/// next whitespace. The last occurrence of a key wins.
pub fn parse_attributes(input: &str) -> Attributes {
    let mut map = HashMap::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if !is_name_char(bytes.get(i)) {
            i += 1;
            continue;
        }

        let key_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'=' {
            i += 1;
        }
        let key = &input[key_start..i];

        let value_start = i + 1;
        let has_value = bytes.get(i) == Some(&b'=')
            && value_start < bytes.len()
            && !bytes[value_start].is_ascii_whitespace();
        if !has_value {
            map.insert(key.to_string(), None);
            if i < bytes.len() {
                i += 1;
            }
            continue;
        }

        let quote = bytes[value_start];
        let quoted = if quote == b'"' || quote == b'\'' {
            closing_quote(bytes, value_start + 1, quote)
                .map(|end| (&input[value_start + 1..end], end + 1))
        } else {
            None
        };
        let (value, next) = quoted.unwrap_or_else(|| {
            let mut end = value_start;
            while end < bytes.len() && !bytes[end].is_ascii_whitespace() {
                end += 1;
            }
            (&input[value_start..end], end)
        });

        map.insert(key.to_string(), Some(value.to_string()));
        i = next;
    }

    Attributes { map }
}

fn closing_quote(bytes: &[u8], from: usize, quote: u8) -> Option<usize> {
    if bytes.get(from) == Some(&quote) {
        return Some(from);
    }
    (from + 1..bytes.len()).find(|&i| bytes[i] == quote && bytes[i - 1] != b'\\')
}
