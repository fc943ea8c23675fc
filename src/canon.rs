//! Lexical path canonicalization.
//!
//! Paths in manifests and command output refer to the same file under many
//! spellings ("./a", "b/../a", "a//"), and the interner must map all of them
//! to one handle.  Canonicalization is purely lexical: symlinks are not
//! resolved and the disk is never consulted.

/// Canonicalize a path, collapsing "./", "//" and ".." segments.
/// "foo/./bar" => "foo/bar", "foo/../bar" => "bar".  Leading ".." segments
/// are preserved; a path that collapses to nothing becomes ".".
pub fn canon_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                // Above the root there is nothing to pop.
                _ if absolute => {}
                _ => parts.push(".."),
            },
            _ => parts.push(part),
        }
    }

    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    for (n, part) in parts.iter().enumerate() {
        if n > 0 {
            out.push('/');
        }
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop() {
        assert_eq!(canon_path("foo"), "foo");
        assert_eq!(canon_path("foo/bar"), "foo/bar");
    }

    #[test]
    fn dot() {
        assert_eq!(canon_path("./foo"), "foo");
        assert_eq!(canon_path("foo/."), "foo");
        assert_eq!(canon_path("foo/./bar"), "foo/bar");
        assert_eq!(canon_path("./"), ".");
        assert_eq!(canon_path("."), ".");
        assert_eq!(canon_path("././"), ".");
    }

    #[test]
    fn not_dot() {
        assert_eq!(canon_path("t/.hidden"), "t/.hidden");
        assert_eq!(canon_path("t/.._lib.c.o"), "t/.._lib.c.o");
    }

    #[test]
    fn slash() {
        assert_eq!(canon_path("/foo"), "/foo");
        assert_eq!(canon_path("foo//bar"), "foo/bar");
        assert_eq!(canon_path("foo/"), "foo");
    }

    #[test]
    fn parent() {
        assert_eq!(canon_path("foo/../bar"), "bar");
        assert_eq!(canon_path("/foo/../bar"), "/bar");
        assert_eq!(canon_path("../foo"), "../foo");
        assert_eq!(canon_path("../foo/../bar"), "../bar");
        assert_eq!(canon_path("../../bar"), "../../bar");
        assert_eq!(canon_path("./../foo"), "../foo");
        assert_eq!(canon_path("foo/.."), ".");
        assert_eq!(canon_path("foo/../.."), "..");
        assert_eq!(canon_path("foo/../../bar"), "../bar");
        assert_eq!(canon_path("/.."), "/");
    }
}
