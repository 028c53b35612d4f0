#[derive(Debug, Clone)]
pub struct TestCase {
    name: &'static str,
    group: TestGroup,
    input: Vec<u8>,
}

impl TestCase {
    pub fn new(name: &'static str, group: TestGroup, input: impl Into<Vec<u8>>) -> Self {
        Self { name, group, input: input.into() }
    }

    pub fn small(name: &'static str, input: impl Into<Vec<u8>>) -> Self {
        Self::new(name, TestGroup::Small, input)
    }

    pub fn normal(name: &'static str, input: impl Into<Vec<u8>>) -> Self {
        Self::new(name, TestGroup::Normal, input)
    }

    pub fn large(name: &'static str, input: impl Into<Vec<u8>>) -> Self {
        Self::new(name, TestGroup::Large, input)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn group(&self) -> TestGroup {
        self.group
    }

    pub fn input(&self) -> &[u8] {
        &self.input
    }
}

#[derive(Clone, Copy, Debug)]
pub enum TestGroup {
    Small,
    Normal,
    Large,
}

pub const SMALL_RESPONSE_HEAD: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 0\r\n\r\n";

pub const LARGE_RESPONSE_HEAD: &str = concat!(
    "HTTP/1.1 200 OK\r\n",
    "Date: Mon, 19 Oct 2026 08:12:31 GMT\r\n",
    "Server: nginx/1.25.3\r\n",
    "Content-Type: text/html; charset=utf-8\r\n",
    "Content-Length: 0\r\n",
    "Connection: keep-alive\r\n",
    "Cache-Control: no-cache, no-store, must-revalidate\r\n",
    "Pragma: no-cache\r\n",
    "Expires: 0\r\n",
    "Vary: Accept-Encoding, Origin\r\n",
    "ETag: \"5f2b9c1a-3e8\"\r\n",
    "Last-Modified: Sun, 18 Oct 2026 21:04:11 GMT\r\n",
    "Access-Control-Allow-Origin: *\r\n",
    "X-Frame-Options: SAMEORIGIN\r\n",
    "X-Content-Type-Options: nosniff\r\n",
    "Strict-Transport-Security: max-age=31536000; includeSubDomains\r\n",
    "Set-Cookie: session=9f8e7d6c5b4a; Path=/; HttpOnly\r\n",
    "Set-Cookie: theme=dark; Path=/\r\n",
    "\r\n"
);

pub const GZIP_REQUEST: &str = "GET /assets/app.css HTTP/1.1\r\nHost: localhost\r\nAccept-Encoding: gzip, deflate, br\r\n\r\n";

/// A `text/css` response of `body_len` bytes with a `Content-Length` body.
pub fn css_response(body_len: usize) -> Vec<u8> {
    let rule = ".panel > .title { color: #336699; margin: 0 auto; padding: 4px 8px; }\n";
    let body: String = rule.chars().cycle().take(body_len).collect();
    format!("HTTP/1.1 200 OK\r\nContent-Type: text/css\r\nContent-Length: {body_len}\r\n\r\n{body}").into_bytes()
}
