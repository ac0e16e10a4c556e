use actix_web::HttpResponse;

mod push;
mod upload;
mod utils;

pub use push::{get_push_task, push, unsupported_push_method};
pub use upload::{get_upload_task, unsupported_upload_method, upload};

pub async fn index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html")
        .body("<a href='/upload'>upload</a><br /><a href='/push'>push</a>")
}
