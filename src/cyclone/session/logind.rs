// org.freedesktop.login1 over the system bus
//
// Austin Shafer - 2024
use super::{BusSignal, PauseKind, Result, SessionBus, SessionError, SessionRecord};
use utils::log;

use std::collections::HashMap;
use std::convert::TryFrom;
use std::os::fd::OwnedFd;
use std::sync::mpsc;
use std::thread;

use zbus::blocking::{Connection, MessageIterator};
use zbus::message::Type as MessageType;
use zbus::zvariant::{self, DynamicType, OwnedObjectPath, OwnedValue};
use zbus::{MatchRule, Message};

const LOGIN1: &str = "org.freedesktop.login1";
const MANAGER_PATH: &str = "/org/freedesktop/login1";
const MANAGER_IFACE: &str = "org.freedesktop.login1.Manager";
const SESSION_IFACE: &str = "org.freedesktop.login1.Session";
const SEAT_IFACE: &str = "org.freedesktop.login1.Seat";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

/// Turn a zbus error into an IPC failure for `method`
///
/// Method errors carry the message logind sent back, which is a lot
/// more useful than the error name.
fn ipc_err(method: &'static str) -> impl Fn(zbus::Error) -> SessionError {
    move |e| {
        let message = match &e {
            zbus::Error::MethodError(name, Some(msg), _) => format!("{}: {}", name, msg),
            _ => e.to_string(),
        };
        SessionError::IPC_FAILED {
            method: method,
            message: message,
        }
    }
}

fn reply_err(method: &'static str) -> impl Fn(zvariant::Error) -> SessionError {
    move |e| SessionError::IPC_FAILED {
        method: method,
        message: format!("unexpected reply: {}", e),
    }
}

/// A system bus connection to logind
pub struct LogindBus {
    lb_conn: Connection,
}

impl LogindBus {
    pub fn connect() -> Result<Self> {
        let conn = Connection::system().map_err(ipc_err("connecting to the system bus"))?;
        Ok(Self { lb_conn: conn })
    }

    fn call<B>(&self, path: &str, iface: &str, method: &'static str, body: &B) -> Result<Message>
    where
        B: serde::Serialize + DynamicType,
    {
        self.lb_conn
            .call_method(Some(LOGIN1), path, Some(iface), method, body)
            .map_err(ipc_err(method))
    }

    fn call_path<B>(&self, method: &'static str, body: &B) -> Result<String>
    where
        B: serde::Serialize + DynamicType,
    {
        let reply = self.call(MANAGER_PATH, MANAGER_IFACE, method, body)?;
        let path: OwnedObjectPath = reply
            .body()
            .deserialize()
            .map_err(ipc_err(method))?;
        Ok(path.as_str().to_string())
    }
}

/// Decode one of the signals we subscribed to
fn parse_signal(msg: &Message) -> Option<BusSignal> {
    let header = msg.header();
    let member = header.member()?;

    match member.as_str() {
        "PauseDevice" => {
            let (major, minor, kind): (u32, u32, String) = msg.body().deserialize().ok()?;
            let kind = match PauseKind::parse(&kind) {
                Some(k) => k,
                None => {
                    log::error!("Unknown PauseDevice type {:?}", kind);
                    return None;
                }
            };
            Some(BusSignal::PauseDevice {
                major: major,
                minor: minor,
                kind: kind,
            })
        }
        "ResumeDevice" => {
            let (major, minor, fd): (u32, u32, zvariant::OwnedFd) =
                msg.body().deserialize().ok()?;
            Some(BusSignal::ResumeDevice {
                major: major,
                minor: minor,
                fd: OwnedFd::from(fd),
            })
        }
        "PropertiesChanged" => {
            let (iface, mut changed, _): (String, HashMap<String, OwnedValue>, Vec<String>) =
                msg.body().deserialize().ok()?;
            if iface != SESSION_IFACE {
                return None;
            }
            let active = bool::try_from(changed.remove("Active")?).ok()?;
            Some(BusSignal::ActiveChanged(active))
        }
        _ => None,
    }
}

impl SessionBus for LogindBus {
    fn session_by_pid(&self, pid: u32) -> Result<String> {
        self.call_path("GetSessionByPID", &pid)
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let reply = self.call(MANAGER_PATH, MANAGER_IFACE, "ListSessions", &())?;
        let sessions: Vec<(String, u32, String, String, OwnedObjectPath)> = reply
            .body()
            .deserialize()
            .map_err(ipc_err("ListSessions"))?;

        Ok(sessions
            .into_iter()
            .map(|(id, uid, _user, seat, path)| SessionRecord {
                id: id,
                uid: uid,
                seat: seat,
                path: path.as_str().to_string(),
            })
            .collect())
    }

    fn get_session(&self, id: &str) -> Result<String> {
        self.call_path("GetSession", &id)
    }

    fn get_seat(&self, id: &str) -> Result<String> {
        self.call_path("GetSeat", &id)
    }

    fn seat_can_graphical(&self, seat_path: &str) -> Result<bool> {
        let reply = self.call(
            seat_path,
            PROPERTIES_IFACE,
            "Get",
            &(SEAT_IFACE, "CanGraphical"),
        )?;
        let value: OwnedValue = reply.body().deserialize().map_err(ipc_err("Get"))?;
        bool::try_from(value).map_err(reply_err("Get"))
    }

    fn subscribe(&self, session_path: &str) -> Result<mpsc::Receiver<BusSignal>> {
        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .sender(LOGIN1)
            .map_err(ipc_err("AddMatch"))?
            .path(session_path)
            .map_err(ipc_err("AddMatch"))?
            .build();
        let signals = MessageIterator::for_match_rule(rule, &self.lb_conn, Some(64))
            .map_err(ipc_err("AddMatch"))?;

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("cyclone-logind".to_string())
            .spawn(move || {
                for msg in signals {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::error!("logind signal stream failed: {}", e);
                            break;
                        }
                    };
                    if let Some(signal) = parse_signal(&msg) {
                        if tx.send(signal).is_err() {
                            break;
                        }
                    }
                }
                log::debug!("logind signal thread exiting");
            })
            .map_err(|e| SessionError::IPC_FAILED {
                method: "subscribe",
                message: e.to_string(),
            })?;

        Ok(rx)
    }

    fn take_control(&self, session_path: &str, force: bool) -> Result<()> {
        self.call(session_path, SESSION_IFACE, "TakeControl", &force)?;
        Ok(())
    }

    fn release_control(&self, session_path: &str) -> Result<()> {
        self.call(session_path, SESSION_IFACE, "ReleaseControl", &())?;
        Ok(())
    }

    fn take_device(&self, session_path: &str, major: u32, minor: u32) -> Result<(OwnedFd, bool)> {
        let reply = self.call(session_path, SESSION_IFACE, "TakeDevice", &(major, minor))?;
        let (fd, paused): (zvariant::OwnedFd, bool) = reply
            .body()
            .deserialize()
            .map_err(ipc_err("TakeDevice"))?;
        Ok((OwnedFd::from(fd), paused))
    }

    fn release_device(&self, session_path: &str, major: u32, minor: u32) -> Result<()> {
        self.call(session_path, SESSION_IFACE, "ReleaseDevice", &(major, minor))?;
        Ok(())
    }

    fn pause_device_complete(&self, session_path: &str, major: u32, minor: u32) -> Result<()> {
        self.call(
            session_path,
            SESSION_IFACE,
            "PauseDeviceComplete",
            &(major, minor),
        )?;
        Ok(())
    }
}
