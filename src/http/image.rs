//! Placeholder image payload served behind the rate limiter.

const FILL_COLOR: &str = "#3b82f6";

/// Generate a simple SVG placeholder of the requested dimensions.
pub fn placeholder_svg(width: u32, height: u32) -> String {
    format!(
        r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg">
    <rect width="100%" height="100%" fill="{FILL_COLOR}"/>
    <text x="50%" y="50%" font-family="Arial" font-size="24" fill="white" dominant-baseline="middle" text-anchor="middle">
        {width}x{height}
    </text>
</svg>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embeds_dimensions() {
        let svg = placeholder_svg(320, 240);
        assert!(svg.starts_with("<svg width=\"320\" height=\"240\""));
        assert!(svg.contains("320x240"));
    }
}
