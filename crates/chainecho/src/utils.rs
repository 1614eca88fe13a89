use {
    bytes::{BufMut, Bytes, BytesMut},
    tcpchain::{io_err, res, utils::parse_proto},
};

/// Splits `tcp!host!port` into host and port.
pub fn parse_tcp_address(arg: &str) -> tcpchain::Result<(&str, u16)> {
    let (proto, host, port) =
        parse_proto(arg).ok_or_else(|| io_err!(InvalidInput, "expected proto!address!port"))?;
    if proto != "tcp" {
        return res!(io_err!(
            InvalidInput,
            format!("unsupported protocol: {}", proto)
        ));
    }
    let port = port
        .parse()
        .map_err(|_| io_err!(InvalidInput, format!("invalid port: {}", port)))?;
    Ok((host, port))
}

/// Prefixes `payload` with its big-endian length in `width` bytes.
pub fn encode_frame(width: usize, payload: &[u8]) -> tcpchain::Result<Bytes> {
    let len = payload.len();
    let mut buf = BytesMut::with_capacity(width + len);
    match width {
        1 if len <= u8::MAX as usize => buf.put_u8(len as u8),
        2 if len <= u16::MAX as usize => buf.put_u16(len as u16),
        4 if len <= i32::MAX as usize => buf.put_u32(len as u32),
        _ => {
            return res!(io_err!(
                InvalidInput,
                format!("{} bytes do not fit a {}-byte length", len, width)
            ));
        }
    }
    buf.put_slice(payload);
    Ok(buf.freeze())
}
