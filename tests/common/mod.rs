#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use image::{Rgb, RgbImage};

use ptz_headcount::detect::DetectorBackend;
use ptz_headcount::{
    BoundingBox, Detection, DetectorFactory, HeadcountConfig, Preset,
};

pub const FRAME_WIDTH: u32 = 32;
pub const FRAME_HEIGHT: u32 = 24;

/// Loopback camera: a VISCA control port plus an HTTP snapshot endpoint.
///
/// The snapshot for preset `n` is a solid frame whose red channel is `n`, so
/// detectors can tell which view they were given.
pub struct FakeCamera {
    pub control_port: u16,
    pub snapshot_url: String,
    current: Arc<AtomicU16>,
    recalls: Arc<Mutex<Vec<u16>>>,
    failing: Arc<Mutex<HashSet<u16>>>,
}

impl FakeCamera {
    pub fn start() -> Self {
        let current = Arc::new(AtomicU16::new(0));
        let recalls = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(Mutex::new(HashSet::new()));

        let control = TcpListener::bind("127.0.0.1:0").expect("bind control");
        let control_port = control.local_addr().unwrap().port();
        {
            let current = Arc::clone(&current);
            let recalls = Arc::clone(&recalls);
            thread::spawn(move || {
                for conn in control.incoming().flatten() {
                    let current = Arc::clone(&current);
                    let recalls = Arc::clone(&recalls);
                    thread::spawn(move || serve_visca(conn, current, recalls));
                }
            });
        }

        let http = TcpListener::bind("127.0.0.1:0").expect("bind http");
        let snapshot_url = format!("http://{}/snapshot.jpg", http.local_addr().unwrap());
        {
            let current = Arc::clone(&current);
            let failing = Arc::clone(&failing);
            thread::spawn(move || {
                for conn in http.incoming().flatten() {
                    let preset = current.load(Ordering::SeqCst);
                    let fail = failing.lock().unwrap().contains(&preset);
                    thread::spawn(move || serve_snapshot(conn, preset, fail));
                }
            });
        }

        Self {
            control_port,
            snapshot_url,
            current,
            recalls,
            failing,
        }
    }

    /// Snapshots taken while `preset` is recalled answer HTTP 500.
    pub fn fail_snapshots_for(&self, preset: u16) {
        self.failing.lock().unwrap().insert(preset);
    }

    pub fn recalls(&self) -> Vec<u16> {
        self.recalls.lock().unwrap().clone()
    }

    /// Configuration pointing at this camera with short timings.
    pub fn config(&self, presets: &[(u16, &str)]) -> HeadcountConfig {
        let mut cfg = HeadcountConfig {
            presets: presets
                .iter()
                .map(|(number, name)| Preset::new(*number, *name))
                .collect(),
            ..HeadcountConfig::default()
        };
        cfg.control.host = "127.0.0.1".to_string();
        cfg.control.port = self.control_port;
        cfg.control.connect_timeout = Duration::from_millis(500);
        cfg.control.command_timeout = Duration::from_millis(500);
        cfg.control.completion_timeout = Duration::from_millis(500);
        cfg.snapshot.url = self.snapshot_url.clone();
        cfg.snapshot.username = Some("admin".to_string());
        cfg.snapshot.password = Some("admin".to_string());
        cfg.snapshot.timeout = Duration::from_secs(2);
        cfg.snapshot.attempts = 1;
        cfg.snapshot.backoff = Duration::from_millis(10);
        cfg.capture.settle = Duration::from_millis(0);
        cfg.capture.recall_backoff = Duration::from_millis(10);
        cfg.workers = 2;
        cfg.queue_depth = 2;
        cfg.drain_timeout = Duration::from_secs(10);
        cfg.validate().expect("test config is valid");
        cfg
    }
}

fn serve_visca(mut conn: TcpStream, current: Arc<AtomicU16>, recalls: Arc<Mutex<Vec<u16>>>) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        let n = match conn.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&chunk[..n]);
        while let Some(end) = pending.iter().position(|b| *b == 0xFF) {
            let message: Vec<u8> = pending.drain(..=end).collect();
            let reply: &[u8] = match message.as_slice() {
                [0x81, 0x01, 0x04, 0x3F, 0x02, preset, 0xFF] => {
                    current.store(*preset as u16, Ordering::SeqCst);
                    recalls.lock().unwrap().push(*preset as u16);
                    &[0x90, 0x41, 0xFF, 0x90, 0x51, 0xFF]
                }
                _ => &[0x90, 0x60, 0x02, 0xFF],
            };
            if conn.write_all(reply).is_err() {
                return;
            }
        }
    }
}

fn serve_snapshot(mut conn: TcpStream, preset: u16, fail: bool) {
    let _ = conn.set_read_timeout(Some(Duration::from_secs(2)));
    let mut request = Vec::new();
    let mut chunk = [0u8; 512];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match conn.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&chunk[..n]),
        }
    }
    let (status, content_type, body) = if fail {
        ("500 Internal Server Error", "text/plain", b"sensor busy".to_vec())
    } else {
        ("200 OK", "image/png", frame_png(preset))
    };
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    );
    let _ = conn.write_all(head.as_bytes());
    let _ = conn.write_all(&body);
}

pub fn frame_png(preset: u16) -> Vec<u8> {
    let image = RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Rgb([preset as u8, 80, 160]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

/// Detector that answers by the preset encoded in the frame's red channel.
pub struct KeyedDetector {
    by_preset: HashMap<u16, Vec<Detection>>,
    failing: HashSet<u16>,
}

impl DetectorBackend for KeyedDetector {
    fn name(&self) -> &'static str {
        "keyed"
    }

    fn detect(&mut self, image: &RgbImage) -> anyhow::Result<Vec<Detection>> {
        let preset = image.get_pixel(0, 0)[0] as u16;
        if self.failing.contains(&preset) {
            anyhow::bail!("model returned malformed tensor");
        }
        Ok(self.by_preset.get(&preset).cloned().unwrap_or_default())
    }
}

pub fn keyed_factory(
    by_preset: HashMap<u16, Vec<Detection>>,
    failing: HashSet<u16>,
) -> Arc<dyn DetectorFactory> {
    Arc::new(move || -> anyhow::Result<Box<dyn DetectorBackend>> {
        Ok(Box::new(KeyedDetector {
            by_preset: by_preset.clone(),
            failing: failing.clone(),
        }))
    })
}

pub fn person_at(x: f32, y: f32) -> Detection {
    Detection::new(BoundingBox::from_center(x, y, 30.0, 60.0), 0.8)
}
