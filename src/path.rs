//! 目标 URL 的路径编码。
//!
//! 每一段单独编码后再用 `/` 拼接，文件名里的 `/` 因此会变成 `%2F`，不会被当成分隔符。
//! 已编码的字符串不要再次传入。

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// `encodeURIComponent` 不编码的字符：字母数字和 `-_.!~*'()`
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// `encodeURI` 额外保留 URI 保留字符，包括 `/`
const URI: &AsciiSet = &COMPONENT
    .remove(b';')
    .remove(b',')
    .remove(b'/')
    .remove(b'?')
    .remove(b':')
    .remove(b'@')
    .remove(b'&')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$')
    .remove(b'#');

/// 逐段编码并用单个 `/` 拼接，空段（前导、末尾或连续分隔符）直接丢弃。
pub fn encode_segments<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut encoded = String::new();
    for segment in segments {
        let segment = segment.as_ref();
        if segment.is_empty() {
            continue;
        }
        if !encoded.is_empty() {
            encoded.push('/');
        }
        encoded.extend(utf8_percent_encode(segment, COMPONENT));
    }
    encoded
}

/// `encode_segments` 的逆操作
pub fn decode_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
        .collect()
}

/// 整条相对路径编码，`/` 保持原样。用于重命名和新建目录。
pub fn encode_uri_path(path: &str) -> String {
    utf8_percent_encode(path, URI).to_string()
}

/// 保证目录 URL 以 `/` 结尾
pub fn directory_url(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    }
}

/// 目录 URL 与已编码的相对路径之间只保留一个 `/`
pub fn join_url(base: &str, encoded: &str) -> String {
    let mut url = directory_url(base);
    url.push_str(encoded.trim_start_matches('/'));
    url
}
