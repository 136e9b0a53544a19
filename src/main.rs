// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # webgate 服务端
//!
//! 基于 Tokio 运行时的多线程 HTTP 服务端，负责：
//! - 读取配置并装配内核（路由、会话、认证、缓存）
//! - 接收 TCP 连接并按 `Content-Length` 读取完整报文
//! - 在阻塞线程池中执行控制器，按 `Accept-Encoding` 压缩响应
//! - 后台管理控制台（CLI 指令交互）

use std::{
    fs,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    runtime::Builder,
    time::timeout,
};

use webgate::{
    param::MAX_BODY_SIZE, site, Config, Exception, Kernel, Request, Response,
};

/// 报文头允许的最大长度
const MAX_HEAD_SIZE: usize = 64 * 1024;

fn main() {
    // 1. 日志系统
    if let Err(e) = log4rs::init_file("config/log4rs.yaml", Default::default()) {
        eprintln!("无法初始化日志系统：{}", e);
        return;
    }

    // 2. 配置
    let config = match Config::from_toml("config/development.toml") {
        Ok(c) => c,
        Err(_) => {
            warn!("配置文件不可用，使用默认配置");
            Config::parse("")
        }
    };
    info!("配置文件已载入");

    // 3. 运行时
    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(r) => r,
        Err(e) => {
            error!("无法创建Tokio运行时：{}", e);
            return;
        }
    };
    info!("工作线程数：{}", config.worker_threads());

    prepare_directories(&config);

    // 4. 内核
    let namespace = config.app().namespace.clone();
    let read_timeout = Duration::from_millis(config.server().read_timeout_ms);
    let port = config.port();
    let local = config.local();
    let mut kernel = match Kernel::new(config) {
        Ok(k) => k,
        Err(e) => {
            error!("内核初始化失败：{}", e);
            return;
        }
    };
    site::register(&mut kernel, &namespace);
    info!("已注册{}个控制器", kernel.router().len());
    let kernel = Arc::new(kernel);

    runtime.block_on(serve(kernel, port, local, read_timeout));
}

/// 创建缓存、nonce、邮件与 users 表所在的目录
fn prepare_directories(config: &Config) {
    let mut dirs = vec![
        config.cache_path().to_string(),
        config.wsse().nonces_path.clone(),
    ];
    if config.mailer().driver == "spool" {
        dirs.push(config.mailer().spool_path.clone());
    }
    if let Some(parent) = Path::new(&config.users().table_file).parent() {
        dirs.push(parent.to_string_lossy().into_owned());
    }
    for dir in dirs.iter().filter(|d| !d.is_empty()) {
        if let Err(e) = fs::create_dir_all(dir) {
            error!("无法创建目录{}：{}", dir, e);
        }
    }
}

async fn serve(kernel: Arc<Kernel>, port: u16, local: bool, read_timeout: Duration) {
    // 支持全地址监听 (0.0.0.0) 或本地回环监听 (127.0.0.1)
    let address = match local {
        true => Ipv4Addr::new(127, 0, 0, 1),
        false => Ipv4Addr::new(0, 0, 0, 0),
    };
    let socket = SocketAddrV4::new(address, port);
    let listener = match TcpListener::bind(socket).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("无法绑定端口：{}，错误：{}", port, e);
            return;
        }
    };
    info!("服务端将在{}上监听Socket连接", socket);

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let active_connection = Arc::new(AtomicU32::new(0));

    // 后台管理控制台
    tokio::spawn({
        let shutdown_flag = Arc::clone(&shutdown_flag);
        let active_connection = Arc::clone(&active_connection);
        let kernel = Arc::clone(&kernel);
        async move {
            let mut reader = BufReader::new(tokio::io::stdin());
            let mut input = String::new();
            loop {
                input.clear();
                match reader.read_line(&mut input).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                match input.trim() {
                    "stop" => {
                        shutdown_flag.store(true, Ordering::SeqCst);
                        println!("停机指令已激活，服务器将在处理完下一个请求后关闭...");
                        break;
                    }
                    "help" => {
                        println!("== webgate Help ==");
                        println!("stop   - 发出停机信号");
                        println!("status - 查看当前服务器运行状态");
                        println!("help   - 显示此帮助信息");
                        println!("==================");
                    }
                    "status" => {
                        println!("== webgate 状态 ==");
                        println!("当前活跃连接数: {}", active_connection.load(Ordering::SeqCst));
                        println!("在线会话数: {}", kernel.sessions().len());
                        println!("==================");
                    }
                    cmd => {
                        println!("无效的命令：{}", cmd);
                    }
                }
            }
        }
    });

    let mut id: u128 = 0;
    loop {
        if shutdown_flag.load(Ordering::SeqCst) {
            info!("主循环接收到停机指令，正在退出...");
            break;
        }

        let (mut stream, addr) = match listener.accept().await {
            Ok(c) => c,
            Err(e) => {
                error!("接受连接失败：{}", e);
                continue;
            }
        };
        debug!("[ID{}]TCP连接已建立：{}", id, addr);

        let active_connection = Arc::clone(&active_connection);
        let kernel = Arc::clone(&kernel);
        tokio::spawn(async move {
            active_connection.fetch_add(1, Ordering::SeqCst);
            handle_connection(&mut stream, addr, id, kernel, read_timeout).await;
            active_connection.fetch_sub(1, Ordering::SeqCst);
        });
        id += 1;
    }
}

/// # 连接处理器
///
/// 读取完整报文、交给内核处理，再把响应写回。
async fn handle_connection(
    stream: &mut TcpStream,
    addr: SocketAddr,
    id: u128,
    kernel: Arc<Kernel>,
    read_timeout: Duration,
) {
    let buffer = match read_request(stream, id, read_timeout).await {
        Ok(Some(b)) => b,
        Ok(None) => return,
        Err(response) => {
            let _ = stream.write_all(&response.as_bytes()).await;
            return;
        }
    };
    debug!("[ID{}]HTTP请求接收完毕，{}字节", id, buffer.len());
    let start_time = Instant::now();

    let mut request = match Request::try_from(&buffer, id) {
        Ok(req) => req,
        Err(e) => {
            warn!("[ID{}]解析HTTP请求失败：{}", id, e);
            let code = match e {
                Exception::BodyTooLarge => 413,
                Exception::UnSupportedRequestMethod => 501,
                Exception::UnsupportedHttpVersion => 505,
                _ => 400,
            };
            let _ = stream
                .write_all(&Response::from_status_code(code, None).as_bytes())
                .await;
            return;
        }
    };
    request.set_client_ip(&addr.ip().to_string());

    // 控制器可能做文件 IO 与 bcrypt 运算，放到阻塞线程池执行
    let result = tokio::task::spawn_blocking(move || {
        let response = kernel.handle(&request, id);
        (request, response)
    })
    .await;
    let (request, mut response) = match result {
        Ok(r) => r,
        Err(e) => {
            error!("[ID{}]处理请求的任务异常退出：{}", id, e);
            let _ = stream
                .write_all(&Response::from_status_code(500, None).as_bytes())
                .await;
            return;
        }
    };

    response.compress_for(request.accept_encoding(), id);
    debug!(
        "[ID{}]HTTP响应构建完成，服务端用时{}ms。",
        id,
        start_time.elapsed().as_millis()
    );

    let bytes = if request.is_head() {
        let (head, length) = response.into_head();
        head.as_head_bytes(length)
    } else {
        response.as_bytes()
    };
    if let Err(e) = stream.write_all(&bytes).await {
        error!("[ID{}]发送响应失败：{}", id, e);
        return;
    }
    let _ = stream.flush().await;
}

/// 按 `Content-Length` 读取完整报文。客户端直接断开时返回 `Ok(None)`，
/// 超时或报文过大时返回需要写回的错误响应。
async fn read_request(
    stream: &mut TcpStream,
    id: u128,
    read_timeout: Duration,
) -> Result<Option<Vec<u8>>, Response> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = match timeout(read_timeout, stream.read(&mut chunk)).await {
            Ok(Ok(0)) if buffer.is_empty() => return Ok(None),
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                error!("[ID{}]读取TCPStream时遇到错误：{}", id, e);
                return Ok(None);
            }
            Err(_) => {
                warn!("[ID{}]读取请求超时", id);
                return Err(Response::from_status_code(408, None));
            }
        };
        buffer.extend_from_slice(&chunk[..n]);

        match Request::expected_length(&buffer) {
            Some(expected) if expected > MAX_HEAD_SIZE + MAX_BODY_SIZE => {
                warn!("[ID{}]请求体过大：{}字节", id, expected);
                return Err(Response::from_status_code(413, None));
            }
            Some(expected) if buffer.len() >= expected => break,
            None if buffer.len() > MAX_HEAD_SIZE => {
                return Err(Response::from_status_code(431, None));
            }
            _ => {}
        }
    }
    Ok(Some(buffer))
}
