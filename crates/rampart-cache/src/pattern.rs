//! Redis-style glob matching for pattern invalidation.
//!
//! Supports `*`, `?` and `\` escapes, which covers the patterns used for
//! key families (`user:*`, `session:??:*`). Character classes are not
//! supported and match literally.

pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();

    let (mut pi, mut ki) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ki < k.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ki));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ki += 1;
                    continue;
                }
                '\\' if pi + 1 < p.len() && p[pi + 1] == k[ki] => {
                    pi += 2;
                    ki += 1;
                    continue;
                }
                c if c != '\\' && c == k[ki] => {
                    pi += 1;
                    ki += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, sk)) => {
                pi = sp + 1;
                ki = sk + 1;
                star = Some((sp, sk + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_star() {
        assert!(glob_match("user:*", "user:42"));
        assert!(glob_match("user:*", "user:"));
        assert!(!glob_match("user:*", "users:42"));
    }

    #[test]
    fn test_question_mark() {
        assert!(glob_match("s:??:x", "s:ab:x"));
        assert!(!glob_match("s:??:x", "s:abc:x"));
    }

    #[test]
    fn test_inner_star_backtracks() {
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
    }

    #[test]
    fn test_escaped_star_is_literal() {
        assert!(glob_match(r"k\*", "k*"));
        assert!(!glob_match(r"k\*", "kx"));
    }
}
