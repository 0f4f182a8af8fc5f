//! Conversion between user-supplied paths and VFS URLs.
//!
//! Every filesystem in the agent is addressed by a URL of the form
//! `scheme://host/path`. Plain paths are accepted too and carry an empty
//! scheme, which the multiplexer treats as `file`. Windows paths are
//! rewritten into URL form before anything else looks at them:
//!
//! - `C:\dir\file` becomes the path `/C:/dir/file`
//! - `\\host\share\file` becomes the path `//host/share/file`
//!
//! All path helpers operate on the path component only and keep the
//! scheme and host prefix intact. Cleaning is lexical and never climbs
//! above the root (`/..` is `/`).

use std::fmt;

/// Scheme assumed for URLs that do not carry one.
pub const DEFAULT_SCHEME: &str = "file";

#[derive(Debug, thiserror::Error)]
pub enum UrlPathError {
    #[error("bad pattern: {0}")]
    BadPattern(#[from] globset::Error),
}

/// Path conventions of the host operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    Unix,
    Windows,
}

impl PathStyle {
    pub const fn native() -> Self {
        if cfg!(windows) {
            PathStyle::Windows
        } else {
            PathStyle::Unix
        }
    }

    pub fn separator(self) -> char {
        match self {
            PathStyle::Unix => '/',
            PathStyle::Windows => '\\',
        }
    }

    pub fn list_separator(self) -> char {
        match self {
            PathStyle::Unix => ':',
            PathStyle::Windows => ';',
        }
    }

    /// Parse a user-supplied string into a URL value.
    pub fn parse(self, input: &str) -> VfsUrl {
        let input = match self {
            PathStyle::Windows => input.replace('\\', "/"),
            PathStyle::Unix => input.to_string(),
        };

        if let Some((scheme, rest)) = split_scheme(&input) {
            let (host, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, ""),
            };
            let path = if path.is_empty() { "/" } else { path };
            return VfsUrl::new(scheme.to_ascii_lowercase(), host, path);
        }

        if self == PathStyle::Windows && has_drive_prefix(&input) {
            let rest = &input[2..];
            let path = if rest.starts_with('/') {
                format!("/{}{}", &input[..2], rest)
            } else {
                format!("/{}/{}", &input[..2], rest)
            };
            return VfsUrl::new("", "", path);
        }

        VfsUrl::new("", "", input)
    }

    /// Absolute-URL predicate: a scheme, a host, or an absolute path.
    pub fn is_abs(self, input: &str) -> bool {
        self.parse(input).is_abs()
    }

    pub fn clean(self, input: &str) -> String {
        let url = self.parse(input);
        let path = self.clean_path(url.path());
        url.with_path(path).to_string()
    }

    /// Lexically clean a URL path component.
    pub fn clean_path(self, path: &str) -> String {
        let (prefix, rest) = self.split_root(path);
        if prefix.is_empty() {
            clean_lexical(rest)
        } else {
            format!("{}{}", prefix, clean_lexical(&format!("/{rest}")))
        }
    }

    /// Resolve `input` against the working directory `wd`.
    pub fn abs(self, input: &str, wd: &VfsUrl) -> VfsUrl {
        let url = self.parse(input);
        if url.is_abs() {
            let path = self.clean_path(url.path());
            return url.with_path(path);
        }
        let joined = if wd.path().is_empty() {
            url.path().to_string()
        } else if wd.path().ends_with('/') {
            format!("{}{}", wd.path(), url.path())
        } else {
            format!("{}/{}", wd.path(), url.path())
        };
        VfsUrl::new(wd.scheme(), wd.host(), self.clean_path(&joined))
    }

    /// Join path elements; the first element supplies the scheme and host.
    pub fn join(self, elems: &[&str]) -> String {
        let mut iter = elems.iter().skip_while(|e| e.is_empty());
        let first = match iter.next() {
            Some(first) => self.parse(first),
            None => return String::new(),
        };
        let mut path = first.path().to_string();
        for elem in iter.filter(|e| !e.is_empty()) {
            let elem = match self {
                PathStyle::Windows => elem.replace('\\', "/"),
                PathStyle::Unix => elem.to_string(),
            };
            if path.is_empty() {
                path = elem;
            } else if path.ends_with('/') {
                path.push_str(&elem);
            } else {
                path = format!("{path}/{elem}");
            }
        }
        let path = self.clean_path(&path);
        first.with_path(path).to_string()
    }

    /// Split into a directory (with trailing separator) and a final element.
    pub fn split(self, input: &str) -> (String, String) {
        let url = self.parse(input);
        let path = url.path();
        let idx = path.rfind('/').map(|i| i + 1).unwrap_or(0);
        let dir = url.with_path(&path[..idx]).to_string();
        (dir, path[idx..].to_string())
    }

    /// Last element of the path component.
    pub fn base(self, input: &str) -> String {
        let url = self.parse(input);
        let path = url.path().trim_end_matches('/');
        if url.path().is_empty() {
            return ".".to_string();
        }
        if path.is_empty() {
            return "/".to_string();
        }
        match path.rfind('/') {
            Some(idx) => path[idx + 1..].to_string(),
            None => path.to_string(),
        }
    }

    /// Everything but the last element, cleaned, with the prefix preserved.
    pub fn dir(self, input: &str) -> String {
        let url = self.parse(input);
        let path = url.path();
        let idx = path.rfind('/').map(|i| i + 1).unwrap_or(0);
        let dir = self.clean_path(&path[..idx]);
        url.with_path(dir).to_string()
    }

    /// File name extension including the dot, or an empty string.
    pub fn ext(self, input: &str) -> String {
        let url = self.parse(input);
        let path = url.path();
        for (idx, ch) in path.char_indices().rev() {
            match ch {
                '/' => break,
                '.' => return path[idx..].to_string(),
                _ => {}
            }
        }
        String::new()
    }

    /// Shell-style match of `name` against `pattern`. `*` does not cross `/`.
    pub fn matches(self, pattern: &str, name: &str) -> Result<bool, UrlPathError> {
        let pattern = self.parse(pattern);
        let name = self.parse(name);
        if !pattern.scheme().is_empty() && pattern.scheme() != name.scheme() {
            return Ok(false);
        }
        let glob = globset::GlobBuilder::new(pattern.path())
            .literal_separator(true)
            .backslash_escape(self == PathStyle::Unix)
            .build()?
            .compile_matcher();
        Ok(glob.is_match(name.path()))
    }

    /// Host-native spelling of a URL path (used by the local backend).
    pub fn to_native(self, url: &VfsUrl) -> String {
        match self {
            PathStyle::Unix => url.path().to_string(),
            PathStyle::Windows => {
                let path = url.path();
                let trimmed = if path.len() >= 3 && has_drive_prefix(&path[1..]) {
                    &path[1..]
                } else {
                    path
                };
                trimmed.replace('/', "\\")
            }
        }
    }

    /// Split off a root that cleaning must never remove: a Windows drive
    /// (`/C:`) or UNC share (`//host/share`).
    fn split_root(self, path: &str) -> (&str, &str) {
        if self != PathStyle::Windows {
            return ("", path);
        }
        if path.starts_with("//") && !path.starts_with("///") {
            let mut seen = 0;
            for (idx, ch) in path.char_indices().skip(2) {
                if ch == '/' {
                    seen += 1;
                    if seen == 2 {
                        return (&path[..idx], &path[idx..]);
                    }
                }
            }
            return (path, "");
        }
        if path.len() >= 3 && path.starts_with('/') && has_drive_prefix(&path[1..]) {
            return (&path[..3], &path[3..]);
        }
        ("", path)
    }
}

/// Scheme, host and path of a VFS location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VfsUrl {
    scheme: String,
    host: String,
    path: String,
}

impl VfsUrl {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            path: path.into(),
        }
    }

    /// Parse with the host's path conventions.
    pub fn parse(input: &str) -> Self {
        PathStyle::native().parse(input)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Scheme with the empty scheme mapped to `file`.
    pub fn effective_scheme(&self) -> &str {
        if self.scheme.is_empty() {
            DEFAULT_SCHEME
        } else {
            &self.scheme
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_abs(&self) -> bool {
        !self.scheme.is_empty() || !self.host.is_empty() || self.path.starts_with('/')
    }

    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            path: path.into(),
        }
    }

    /// Path handed to a backend: `//host/path` when a host is present.
    pub fn backend_path(&self) -> String {
        if self.host.is_empty() {
            self.path.clone()
        } else {
            format!("//{}{}", self.host, self.path)
        }
    }
}

impl fmt::Display for VfsUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme.is_empty() {
            if self.host.is_empty() {
                return f.write_str(&self.path);
            }
            return write!(f, "//{}{}", self.host, self.path);
        }
        write!(f, "{}://{}{}", self.scheme, self.host, self.path)
    }
}

pub fn parse(input: &str) -> VfsUrl {
    PathStyle::native().parse(input)
}

pub fn is_abs(input: &str) -> bool {
    PathStyle::native().is_abs(input)
}

pub fn clean(input: &str) -> String {
    PathStyle::native().clean(input)
}

pub fn abs(input: &str, wd: &VfsUrl) -> VfsUrl {
    PathStyle::native().abs(input, wd)
}

pub fn join(elems: &[&str]) -> String {
    PathStyle::native().join(elems)
}

pub fn split(input: &str) -> (String, String) {
    PathStyle::native().split(input)
}

pub fn base(input: &str) -> String {
    PathStyle::native().base(input)
}

pub fn dir(input: &str) -> String {
    PathStyle::native().dir(input)
}

pub fn ext(input: &str) -> String {
    PathStyle::native().ext(input)
}

pub fn matches(pattern: &str, name: &str) -> Result<bool, UrlPathError> {
    PathStyle::native().matches(pattern, name)
}

/// Clean an absolute, slash-separated backend path. Relative input is
/// treated as relative to the root.
pub fn clean_abs(path: &str) -> String {
    clean_lexical(&format!("/{path}"))
}

/// Parent directory of a cleaned absolute path (`/` for top-level entries).
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Final element of a cleaned absolute path (empty for the root).
pub fn file_name_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

fn split_scheme(input: &str) -> Option<(&str, &str)> {
    let idx = input.find("://")?;
    let scheme = &input[..idx];
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if scheme.len() < 2 || !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return None;
    }
    Some((scheme, &input[idx + 3..]))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn clean_lexical(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIX: PathStyle = PathStyle::Unix;
    const WIN: PathStyle = PathStyle::Windows;

    #[test]
    fn test_parse_scheme_host_path() {
        let url = UNIX.parse("nats://bundles/scripts/hello.fzz");
        assert_eq!(url.scheme(), "nats");
        assert_eq!(url.host(), "bundles");
        assert_eq!(url.path(), "/scripts/hello.fzz");

        let url = UNIX.parse("mem:///tmp/a");
        assert_eq!(url.scheme(), "mem");
        assert_eq!(url.host(), "");
        assert_eq!(url.path(), "/tmp/a");

        let url = UNIX.parse("relative/path");
        assert_eq!(url.effective_scheme(), "file");
        assert!(!url.is_abs());
    }

    #[test]
    fn test_parse_windows_paths() {
        let url = WIN.parse(r"C:\Users\me\file.txt");
        assert_eq!(url.scheme(), "");
        assert_eq!(url.path(), "/C:/Users/me/file.txt");
        assert!(url.is_abs());

        let url = WIN.parse(r"\\server\share\dir\f");
        assert_eq!(url.scheme(), "");
        assert_eq!(url.path(), "//server/share/dir/f");

        assert_eq!(WIN.to_native(&WIN.parse(r"C:\a\b")), r"C:\a\b");
        assert_eq!(WIN.to_native(&WIN.parse(r"\\h\s\x")), r"\\h\s\x");
    }

    #[test]
    fn test_clean_never_climbs_above_root() {
        assert_eq!(UNIX.clean("/.."), "/");
        assert_eq!(UNIX.clean("/a/../../b/./c//"), "/b/c");
        assert_eq!(UNIX.clean("a/../.."), "..");
        assert_eq!(UNIX.clean(""), ".");
        assert_eq!(UNIX.clean("mem:///x/../y"), "mem:///y");
        assert_eq!(UNIX.clean("nats://bucket/../../k"), "nats://bucket/k");
        assert_eq!(WIN.clean(r"C:\a\..\.."), "/C:/");
        assert_eq!(WIN.clean(r"\\h\s\a\..\.."), "//h/s/");
    }

    #[test]
    fn test_clean_is_idempotent() {
        for p in ["/a/./b/../c", "x//y/", "../a", "mem:///a/..", "file:///"] {
            let once = UNIX.clean(p);
            assert_eq!(UNIX.clean(&once), once, "{p}");
        }
    }

    #[test]
    fn test_abs_resolves_against_working_directory() {
        let wd = VfsUrl::new("mem", "", "/work");
        let url = UNIX.abs("sub/../file.txt", &wd);
        assert_eq!(url.to_string(), "mem:///work/file.txt");

        let url = UNIX.abs("/etc/hosts", &wd);
        assert_eq!(url.to_string(), "/etc/hosts");

        let url = UNIX.abs("nats://repo/a", &wd);
        assert_eq!(url.to_string(), "nats://repo/a");
    }

    #[test]
    fn test_abs_is_idempotent() {
        let wd = VfsUrl::new("nats", "repo", "/scripts");
        for p in ["a/b", "../x", "/abs", "mem:///m", "."] {
            let once = UNIX.abs(p, &wd);
            let twice = UNIX.abs(&once.to_string(), &wd);
            assert_eq!(once, twice, "{p}");
        }
    }

    #[test]
    fn test_join_split_law() {
        for p in ["/a/b/c", "mem:///x/y", "nats://bucket/k/v.txt", "rel/file", "/a/../b"] {
            let (dir, file) = UNIX.split(p);
            assert_eq!(UNIX.join(&[&dir, &file]), UNIX.clean(p), "{p}");
        }
    }

    #[test]
    fn test_base_dir_ext() {
        assert_eq!(UNIX.base("mem:///a/b.txt"), "b.txt");
        assert_eq!(UNIX.base("/"), "/");
        assert_eq!(UNIX.base("a/b/"), "b");
        assert_eq!(UNIX.dir("mem:///a/b.txt"), "mem:///a");
        assert_eq!(UNIX.dir("file.txt"), ".");
        assert_eq!(UNIX.ext("/x/bundle.fzz"), ".fzz");
        assert_eq!(UNIX.ext("/x.d/noext"), "");
    }

    #[test]
    fn test_matches() {
        assert!(UNIX.matches("/scripts/*.fzz", "/scripts/hello.fzz").unwrap());
        assert!(!UNIX.matches("/scripts/*.fzz", "/scripts/sub/hello.fzz").unwrap());
        assert!(UNIX.matches("mem:///a/?", "mem:///a/b").unwrap());
        assert!(!UNIX.matches("mem:///a/?", "file:///a/b").unwrap());
        assert!(UNIX.matches("/a/[", "/a/b").is_err());
    }

    #[test]
    fn test_backend_path_helpers() {
        assert_eq!(clean_abs("a//b/.."), "/a");
        assert_eq!(parent_of("/a/b"), "/a");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(file_name_of("/a/b"), "b");
        assert_eq!(VfsUrl::new("nats", "r1", "/k").backend_path(), "//r1/k");
    }
}
