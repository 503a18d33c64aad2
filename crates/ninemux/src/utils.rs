use crate::error;

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

/// Split a `proto!addr!port` listen address into the protocol name and
/// the address to bind. For `unix` the port component is a
/// disambiguating suffix and only the path is returned.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    match proto {
        "unix" => Some((proto, addr.to_owned())),
        _ => Some((proto, format!("{addr}:{port}"))),
    }
}
