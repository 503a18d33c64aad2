use {
    async_trait::async_trait,
    bytes::Bytes,
    clap::Parser,
    ninemux::{Error, MessageHandler, MsgType, Response, Result, srv::serve},
};

/// Answers every request by echoing its body back with the matching
/// R-type opcode. Useful for exercising 9P clients and transports
/// without a real filesystem behind them.
#[derive(Clone)]
struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn process_msg(&self, typ: u8, body: Bytes) -> Result<Response> {
        // 9P pairs each T-opcode with the next odd opcode; wrap so an
        // opcode of 255 cannot overflow
        Ok(Response::new(typ.wrapping_add(1), body))
    }

    fn on_error(&self, err: &Error) -> Response {
        Response::new(MsgType::RError as u8, err.to_string().into_bytes())
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,
}

async fn echo9p_main(Cli { address }: Cli) -> Result<i32> {
    println!("[*] Ready to accept clients: {}", address);
    serve(Echo, &address).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = echo9p_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
