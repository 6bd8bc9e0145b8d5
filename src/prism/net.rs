use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Config shorthand `":PORT"` means "all interfaces"; `SocketAddr` parsing and
/// the Tokio bind APIs do not accept it, so expand to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Whether `addr` still needs a port appended (no `:` after any IPv6 bracket).
pub fn needs_port(addr: &str) -> bool {
    let s = addr.trim();
    if s.is_empty() {
        return false;
    }
    let tail = match s.rfind(']') {
        Some(pos) => &s[pos + 1..],
        None => s,
    };
    !tail.contains(':')
}
