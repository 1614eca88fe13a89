use {crate::error, std::sync::PoisonError};

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Splits a `proto!address!port` string, e.g. `tcp!127.0.0.1!564`.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    Some((proto, addr, port))
}

/// Recovers the guard of a poisoned lock.
///
/// Every critical section in this crate leaves its data consistent before
/// any user code can run, so a poisoned lock still holds valid state.
pub(crate) fn unpoison<G>(result: ::std::result::Result<G, PoisonError<G>>) -> G {
    result.unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_proto_splits_three_parts() {
        assert_eq!(
            parse_proto("tcp!127.0.0.1!7000"),
            Some(("tcp", "127.0.0.1", "7000"))
        );
        assert_eq!(parse_proto("tcp!127.0.0.1"), None);
    }
}
