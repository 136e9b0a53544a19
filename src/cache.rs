use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;

use crate::param::CRLF;
use crate::response::{format_date, Response};

lazy_static! {
    // 写入时间戳：秒.微秒
    static ref STAMP: Regex = Regex::new(r"^\d+\.\d{6}$").unwrap();
}

/// 基于文件的 HTTP 响应缓存。
///
/// 每次保存都会生成一个 `<filename>.<秒>.<微秒>` 文件，文件内容为
/// 状态行、以换行分隔的响应头和响应体，三者之间以 CRLF 分隔。
/// 读取时按字典序取最新的一个文件，过期则删除。
pub struct HttpCache {
    storage_path: PathBuf,
    filename: String,
    delay: i64,
}

impl HttpCache {
    // 根据存储目录、文件名与有效期（秒）构造
    pub fn new(storage_path: impl AsRef<Path>, filename: &str, delay: i64) -> Self {
        let mut cache = Self {
            storage_path: storage_path.as_ref().to_path_buf(),
            filename: String::new(),
            delay,
        };
        cache.set_filename(filename);
        cache
    }

    // 只保留文件名部分，避免路径穿越
    pub fn set_filename(&mut self, filename: &str) -> &mut Self {
        self.filename = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self
    }

    pub fn set_delay(&mut self, seconds: i64) -> &mut Self {
        self.delay = seconds;
        self
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn delay(&self) -> i64 {
        self.delay
    }

    // 保存
    pub fn save(&self, response: &mut Response) -> io::Result<()> {
        self.save_at(response, Utc::now())
    }

    pub fn save_at(&self, response: &mut Response, now: DateTime<Utc>) -> io::Result<()> {
        if self.delay <= 0 {
            return Ok(());
        }
        fs::create_dir_all(&self.storage_path)?;

        let stamp = format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros());
        let tmp_path = self
            .storage_path
            .join(format!("{}{}.tmp", self.filename, stamp));

        response
            .set_header("Last-Modified", format_date(&now))
            .set_header("Expires", format_date(&(now + Duration::seconds(self.delay))))
            .set_header("Cache-Control", format!("public, s-maxage={}", self.delay));

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(response.status_line().as_bytes())?;
        file.write_all(CRLF.as_bytes())?;
        file.write_all(response.headers_string().as_bytes())?;
        file.write_all(CRLF.as_bytes())?;
        file.write_all(response.body())?;
        file.sync_all()?;
        drop(file);

        let out_path = self
            .storage_path
            .join(format!("{}.{}", self.filename, stamp));
        fs::rename(&tmp_path, &out_path)?;
        debug!("已缓存响应：{}", out_path.display());
        Ok(())
    }

    // 查询有效缓存
    pub fn read(&self) -> io::Result<Option<Response>> {
        self.read_at(Utc::now())
    }

    pub fn read_at(&self, now: DateTime<Utc>) -> io::Result<Option<Response>> {
        if self.delay <= 0 {
            return Ok(None);
        }
        let mut files = self.cached_files()?;
        let latest = match files.pop() {
            Some(f) => f,
            None => return Ok(None),
        };

        let written = match written_at(&latest) {
            Some(t) => t,
            None => {
                warn!("无法解析缓存文件名：{}", latest.display());
                return Ok(None);
            }
        };

        if now.timestamp() - written > self.delay {
            debug!("缓存已过期：{}", latest.display());
            fs::remove_file(&latest)?;
            return Ok(None);
        }

        // 被新文件取代的旧文件
        for old in files {
            let _ = fs::remove_file(old);
        }

        let content = fs::read(&latest)?;
        Ok(Some(parse_cache_file(&content)))
    }

    fn cached_files(&self) -> io::Result<Vec<PathBuf>> {
        let prefix = format!("{}.", self.filename);
        let entries = match fs::read_dir(&self.storage_path) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_prefix(&prefix)
                    .map_or(false, |stamp| STAMP.is_match(stamp))
            })
            .map(|e| e.path())
            .collect();
        files.sort();
        Ok(files)
    }
}

// 文件名的倒数第二段是写入时间（秒）
fn written_at(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 2 {
        return None;
    }
    parts[parts.len() - 2].parse().ok()
}

fn parse_cache_file(content: &[u8]) -> Response {
    let crlf = CRLF.as_bytes();
    let first = find(content, crlf, 0);
    let second = first.and_then(|p| find(content, crlf, p + 2));

    let (status_line, headers, body) = match (first, second) {
        (Some(a), Some(b)) => (&content[..a], &content[a + 2..b], &content[b + 2..]),
        (Some(a), None) => (&content[..a], &content[a + 2..], &content[content.len()..]),
        _ => (content, &content[content.len()..], &content[content.len()..]),
    };

    let mut response = Response::new();
    let status_line = String::from_utf8_lossy(status_line);
    if let Some(code) = status_line
        .split(' ')
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
    {
        response.set_code(code);
    }
    for line in String::from_utf8_lossy(headers).split('\n') {
        if let Some((name, value)) = line.split_once(':') {
            response.add_header(name, value.trim());
        }
    }
    response.set_body(body.to_vec());
    response
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn sample() -> Response {
        let mut response = Response::html(200, "<p>cached</p>\r\nsecond line");
        response.set_header("X-Custom", "a: b");
        response
    }

    #[test]
    fn test_disabled_cache_is_noop() {
        let dir = TempDir::new().unwrap();
        let cache = HttpCache::new(dir.path(), "index.cache", 0);
        cache.save(&mut sample()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(cache.read().unwrap().is_none());
    }

    #[test]
    fn test_save_sets_cache_headers() {
        let dir = TempDir::new().unwrap();
        let cache = HttpCache::new(dir.path(), "index.cache", 60);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut response = sample();
        cache.save_at(&mut response, now).unwrap();

        assert_eq!(response.header("Cache-Control"), Some("public, s-maxage=60"));
        assert_eq!(response.header("Last-Modified"), Some("Thu, 01 Jan 2026 00:00:00 GMT"));
        assert_eq!(response.header("Expires"), Some("Thu, 01 Jan 2026 00:01:00 GMT"));

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["index.cache.1767225600.000000".to_string()]);
    }

    #[test]
    fn test_round_trip_within_ttl() {
        let dir = TempDir::new().unwrap();
        let cache = HttpCache::new(dir.path(), "news.cache", 60);
        let now = Utc::now();
        let mut response = sample();
        cache.save_at(&mut response, now).unwrap();

        let cached = cache.read_at(now + Duration::seconds(30)).unwrap().unwrap();
        assert_eq!(cached.status_code(), 200);
        assert_eq!(cached.body(), response.body());
        assert_eq!(cached.headers(), response.headers());
    }

    #[test]
    fn test_expired_file_is_deleted() {
        let dir = TempDir::new().unwrap();
        let cache = HttpCache::new(dir.path(), "news.cache", 10);
        let now = Utc::now();
        cache.save_at(&mut sample(), now).unwrap();

        assert!(cache.read_at(now + Duration::seconds(11)).unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_latest_file_wins() {
        let dir = TempDir::new().unwrap();
        let cache = HttpCache::new(dir.path(), "news.cache", 60);
        let now = Utc::now();
        cache.save_at(&mut Response::html(200, "old"), now).unwrap();
        cache
            .save_at(&mut Response::html(200, "new"), now + Duration::seconds(5))
            .unwrap();

        let cached = cache.read_at(now + Duration::seconds(6)).unwrap().unwrap();
        assert_eq!(cached.body_str(), "new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_keeps_status_code() {
        let dir = TempDir::new().unwrap();
        let cache = HttpCache::new(dir.path(), "gone.cache", 60);
        let now = Utc::now();
        cache.save_at(&mut Response::html(410, "gone"), now).unwrap();

        let cached = cache.read_at(now).unwrap().unwrap();
        assert_eq!(cached.status_code(), 410);
    }

    #[test]
    fn test_other_uids_are_ignored() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        HttpCache::new(dir.path(), "a.cache", 60)
            .save_at(&mut sample(), now)
            .unwrap();

        let other = HttpCache::new(dir.path(), "b.cache", 60);
        assert!(other.read_at(now).unwrap().is_none());
    }

    #[test]
    fn test_uid_with_same_prefix_is_ignored() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        HttpCache::new(dir.path(), "a.cache.b.cache", 60)
            .save_at(&mut Response::html(200, "OTHER PAGE"), now)
            .unwrap();

        let cache = HttpCache::new(dir.path(), "a.cache", 60);
        assert!(cache.read_at(now).unwrap().is_none());
        // 另一个 uid 的文件不受影响
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_filename_is_sanitized() {
        let cache = HttpCache::new("/tmp", "../../etc/passwd", 60);
        assert_eq!(cache.filename(), "passwd");
    }
}
