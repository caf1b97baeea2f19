use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr).await?;
    println!("mock transfer server on http://{addr}");
    println!("  GET /bytes/{{n}}  POST|PUT /echo  GET /uploads  GET /status/{{code}}");
    println!("  GET /slow/{{ms}}  GET /headers  GET /redirect/{{n}}");
    mock_server::run(listener).await
}
