use crate::Error;
use reqwest::Response;

/// processes a response, returning it if it is OK,
/// decomposes it into an error if it's not ok.
pub async fn handle(resp: Response) -> crate::Result<Response> {
    if let Err(request_error) = resp.error_for_status_ref() {
        let extra = resp.text().await?;
        Err(Error::Service {
            extra,
            request_error,
        })
    } else {
        Ok(resp)
    }
}

/// Replaces the path of `base` with `segments`, percent-encoding each one.
pub fn with_segments(base: &reqwest::Url, segments: &[&str]) -> crate::Result<reqwest::Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::Msg(format!("{} cannot be used as a base url", base).into()))?
        .clear()
        .extend(segments);
    Ok(url)
}
