//! Release fixtures: ZIP archives, index pages and a mock release server.

use std::io::Write;
use std::path::Path;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

pub const PERIOD: &str = "2025-08";

/// Builds a deflated ZIP archive in memory.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start zip entry");
        writer.write_all(contents).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Writes a ZIP archive to `path`.
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    std::fs::write(path, zip_bytes(entries)).expect("write zip file");
}

/// An index page in the layout of the public release listing.
pub fn index_page(names: &[&str]) -> String {
    let rows: String = names
        .iter()
        .map(|name| {
            format!(
                "<tr><td><a href=\"{name}\">{name}</a></td><td align=\"right\">2025-08-10 22:10</td></tr>\n"
            )
        })
        .collect();
    format!(
        "<html><head><title>Index of /{PERIOD}</title></head><body><table>\n\
         <tr><th><a href=\"?C=N;O=D\">Name</a></th></tr>\n\
         <tr><td><a href=\"/\">Parent Directory</a></td></tr>\n{rows}</table></body></html>"
    )
}

/// Mounts the period index listing `names`.
pub async fn mount_index(server: &MockServer, names: &[&str]) {
    Mock::given(method("GET"))
        .and(path(format!("/{PERIOD}/")))
        .respond_with(ResponseTemplate::new(200).set_body_string(index_page(names)))
        .mount(server)
        .await;
}

/// Mounts one archive, expecting exactly `expected_gets` GET requests.
pub async fn mount_archive(server: &MockServer, name: &str, body: Vec<u8>, expected_gets: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/{PERIOD}/{name}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(expected_gets)
        .mount(server)
        .await;
}

/// Mounts one archive that always answers `status`.
pub async fn mount_status(server: &MockServer, name: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(format!("/{PERIOD}/{name}")))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Latin-1 `;`-delimited, quoted record.
pub fn record(fields: &[&str]) -> Vec<u8> {
    let mut line: Vec<u8> = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            line.push(b';');
        }
        line.push(b'"');
        line.extend(field.chars().map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?')));
        line.push(b'"');
    }
    line.push(b'\n');
    line
}

/// Concatenated records.
pub fn records(rows: &[&[&str]]) -> Vec<u8> {
    rows.iter().flat_map(|row| record(row)).collect()
}
