pub const ROUTE_API_STATUS: &str = "/api/status";
pub const ROUTE_API_RUN: &str = "/api/run";
pub const ROUTE_RUN: &str = "/run";

pub const PARAM_DEVICE_ID: &str = "device_id";

pub const RUN_ACK: &str = "OK";
pub const NOT_FOUND_BODY: &str = "File Not Found";

pub const STATIC_ASSETS: [(&str, &str, &str); 6] = [
    ("/", "index.html", "text/html"),
    ("/scripts.js", "scripts.js", "text/javascript"),
    ("/manifest.json", "manifest.json", "application/json"),
    ("/favicon.ico", "favicon.ico", "image/x-icon"),
    ("/icon192.png", "icon192.png", "image/png"),
    ("/icon.png", "icon.png", "image/png"),
];

pub fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    query
        .split('&')
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .find(|(name, _)| *name == key)
        .map(|(_, value)| percent_decode(value))
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|d| d as u8)
}

pub fn content_type_for(path: &str) -> Option<&'static str> {
    let path = path.split('?').next().unwrap_or(path);
    STATIC_ASSETS
        .iter()
        .find(|(route, _, _)| *route == path)
        .map(|(_, _, content_type)| *content_type)
}
