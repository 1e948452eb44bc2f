//! Sensitive operations, each checked against the installed sandbox before it
//! touches the OS. Server code and predicates perform filesystem mutation,
//! process and network work through these functions.

use std::convert::Infallible;
use std::fs::{Metadata, ReadDir};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::Path;
use std::process::{Child, Command};

use super::{check, Operation};
use crate::GateError;

pub fn metadata(path: impl AsRef<Path>) -> Result<Metadata, GateError> {
    let path = path.as_ref();
    check(&Operation::Read(path.to_path_buf()))?;
    Ok(std::fs::metadata(path)?)
}

pub fn read_dir(path: impl AsRef<Path>) -> Result<ReadDir, GateError> {
    let path = path.as_ref();
    check(&Operation::Read(path.to_path_buf()))?;
    Ok(std::fs::read_dir(path)?)
}

pub fn read(path: impl AsRef<Path>) -> Result<Vec<u8>, GateError> {
    let path = path.as_ref();
    check(&Operation::Read(path.to_path_buf()))?;
    Ok(std::fs::read(path)?)
}

pub fn write(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<(), GateError> {
    let path = path.as_ref();
    check(&Operation::Write(path.to_path_buf()))?;
    Ok(std::fs::write(path, contents)?)
}

pub fn create_dir_all(path: impl AsRef<Path>) -> Result<(), GateError> {
    let path = path.as_ref();
    check(&Operation::Write(path.to_path_buf()))?;
    Ok(std::fs::create_dir_all(path)?)
}

pub fn rename(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<(), GateError> {
    let (from, to) = (from.as_ref(), to.as_ref());
    check(&Operation::Write(from.to_path_buf()))?;
    check(&Operation::Write(to.to_path_buf()))?;
    Ok(std::fs::rename(from, to)?)
}

pub fn remove_file(path: impl AsRef<Path>) -> Result<(), GateError> {
    let path = path.as_ref();
    check(&Operation::Delete(path.to_path_buf()))?;
    Ok(std::fs::remove_file(path)?)
}

pub fn remove_dir(path: impl AsRef<Path>) -> Result<(), GateError> {
    let path = path.as_ref();
    check(&Operation::Delete(path.to_path_buf()))?;
    Ok(std::fs::remove_dir(path)?)
}

pub fn remove_dir_all(path: impl AsRef<Path>) -> Result<(), GateError> {
    let path = path.as_ref();
    check(&Operation::Delete(path.to_path_buf()))?;
    Ok(std::fs::remove_dir_all(path)?)
}

pub fn spawn(command: &mut Command) -> Result<Child, GateError> {
    let program = command.get_program().to_string_lossy().into_owned();
    check(&Operation::Exec(program))?;
    Ok(command.spawn()?)
}

pub fn exit(code: i32) -> Result<Infallible, GateError> {
    check(&Operation::Exit(code))?;
    std::process::exit(code)
}

pub fn tcp_connect(addr: &str) -> Result<TcpStream, GateError> {
    check(&Operation::Connect(addr.to_string()))?;
    Ok(TcpStream::connect(addr)?)
}

pub fn tcp_listen(addr: &str) -> Result<TcpListener, GateError> {
    check(&Operation::Listen(addr.to_string()))?;
    Ok(TcpListener::bind(addr)?)
}

pub fn accept(listener: &TcpListener) -> Result<(TcpStream, SocketAddr), GateError> {
    let local = listener.local_addr()?;
    check(&Operation::Accept(local.to_string()))?;
    Ok(listener.accept()?)
}

pub fn join_multicast_v4(
    socket: &UdpSocket,
    group: Ipv4Addr,
    interface: Ipv4Addr,
) -> Result<(), GateError> {
    check(&Operation::Multicast(group.into()))?;
    Ok(socket.join_multicast_v4(&group, &interface)?)
}

/// For collaborators about to load plugin code.
pub fn check_create_loader() -> Result<(), GateError> {
    check(&Operation::CreateLoader)
}

/// For collaborators about to link a native library.
pub fn check_link(library: &str) -> Result<(), GateError> {
    check(&Operation::Link(library.to_string()))
}
