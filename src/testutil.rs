//! Shared test fixture: a scripted heat pump on the far end of an
//! in-memory duplex stream.
//!
//! The fake pump keeps a plain register map, echoes every request frame
//! first (the RS-485 adapter does on the real link) and then answers
//! function codes 0x03/0x06/0x10. A write hook lets controller tests
//! simulate plant reactions (for example: the compressor spinning up once
//! a negative degree-minutes value is written).

use crate::frame::AsciiFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

type WriteHook = Box<dyn FnMut(&mut HashMap<u16, u16>, u16, u16) + Send>;

#[derive(Clone)]
pub struct FakeRegisters {
    map: Arc<Mutex<HashMap<u16, u16>>>,
    writes: Arc<AtomicUsize>,
    hook: Arc<Mutex<Option<WriteHook>>>,
}

impl FakeRegisters {
    pub fn set(&self, id: u16, raw: u16) {
        self.map.lock().unwrap().insert(id, raw);
    }

    pub fn get(&self, id: u16) -> Option<u16> {
        self.map.lock().unwrap().get(&id).copied()
    }

    /// Number of single-register writes the pump has accepted.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Installs a hook run after every accepted write.
    pub fn on_write<F>(&self, hook: F)
    where
        F: FnMut(&mut HashMap<u16, u16>, u16, u16) + Send + 'static,
    {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

pub fn spawn_fake_pump(mut stream: DuplexStream) -> FakeRegisters {
    let registers = FakeRegisters {
        map: Arc::new(Mutex::new(HashMap::new())),
        writes: Arc::new(AtomicUsize::new(0)),
        hook: Arc::new(Mutex::new(None)),
    };
    let state = registers.clone();
    tokio::spawn(async move {
        let mut line = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for &b in &buf[..n] {
                if b == b':' {
                    line.clear();
                }
                line.push(b);
                if b != b'\n' {
                    continue;
                }
                let text = String::from_utf8(std::mem::take(&mut line)).unwrap();
                let request = AsciiFrame::parse(&text).unwrap();
                // half-duplex echo of the request itself
                stream.write_all(text.as_bytes()).await.unwrap();
                if let Some(response) = state.respond(&request) {
                    stream.write_all(response.as_str().as_bytes()).await.unwrap();
                }
            }
        }
    });
    registers
}

impl FakeRegisters {
    fn respond(&self, request: &AsciiFrame) -> Option<AsciiFrame> {
        let unit = request.payload().first().copied()?;
        let fc = request.payload().get(1).copied()?;
        // wire addresses are the vendor's register ids
        let addr = request.u16_at(2)? as u16;
        match fc {
            0x03 => {
                let quantity = request.u16_at(4)? as u16;
                let map = self.map.lock().unwrap();
                let mut payload = vec![unit, fc, (quantity * 2) as u8];
                for k in 0..quantity {
                    let word = map.get(&(addr + k)).copied().unwrap_or(0);
                    payload.push((word >> 8) as u8);
                    payload.push((word & 0xff) as u8);
                }
                AsciiFrame::encode(&payload).ok()
            }
            0x06 => {
                let value = request.u16_at(4)? as u16;
                {
                    let mut map = self.map.lock().unwrap();
                    map.insert(addr, value);
                    if let Some(hook) = self.hook.lock().unwrap().as_mut() {
                        hook(&mut map, addr, value);
                    }
                }
                self.writes.fetch_add(1, Ordering::SeqCst);
                // a 0x06 response mirrors the request
                AsciiFrame::encode(request.payload()).ok()
            }
            0x10 => {
                let quantity = request.u16_at(4)? as u16;
                {
                    let mut map = self.map.lock().unwrap();
                    for k in 0..quantity {
                        let word = request.u16_at(7 + 2 * k as usize)? as u16;
                        map.insert(addr + k, word);
                    }
                }
                let payload = [
                    unit,
                    fc,
                    (addr >> 8) as u8,
                    (addr & 0xff) as u8,
                    (quantity >> 8) as u8,
                    (quantity & 0xff) as u8,
                ];
                AsciiFrame::encode(&payload).ok()
            }
            _ => None,
        }
    }
}
