/** \brief 未变更代码的占位标记（JS 风格与 Python 风格）。 */
pub const EXISTING_CODE_MARKERS: [&str; 2] = ["// ... existing code ...", "# ... existing code ..."];

fn has_marker(line: &str) -> bool {
    EXISTING_CODE_MARKERS.iter().any(|m| line.contains(m))
}

/**
 * \brief 将 LLM 给出的 edit 应用到原代码上。
 *
 * 这不是真正的 patch：含占位标记时只是删除标记行，保留其余内容。
 * 多个编辑区域之间的相对位置无法还原。
 *
 * 只有在删除标记后一行都不剩时才回退到原代码；剩下的空行也算一行，
 * 所以 `"// ... existing code ...\n"` 会得到空字符串。
 */
pub fn apply_edit(original: &str, edit: &str) -> String {
    if edit.is_empty() {
        return original.to_string();
    }
    if !has_marker(edit) {
        return edit.to_string();
    }
    let kept: Vec<&str> = edit.split('\n').filter(|line| !has_marker(line)).collect();
    if kept.is_empty() {
        original.to_string()
    } else {
        kept.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_edit_is_noop() {
        assert_eq!(apply_edit("foo\nbar", ""), "foo\nbar");
    }

    #[test]
    fn test_edit_without_marker_replaces_file() {
        assert_eq!(apply_edit("foo\nbar", "baz"), "baz");
    }

    #[test]
    fn test_marker_lines_removed() {
        assert_eq!(apply_edit("foo", "// ... existing code ...\nbaz"), "baz");
        assert_eq!(
            apply_edit("x = 1", "import os\n    # ... existing code ...\nprint(os.name)"),
            "import os\nprint(os.name)"
        );
    }

    #[test]
    fn test_only_markers_falls_back_to_original() {
        assert_eq!(
            apply_edit("keep me", "// ... existing code ...\n# ... existing code ..."),
            "keep me"
        );
    }

    #[test]
    fn test_trailing_blank_line_survives_marker_removal() {
        assert_eq!(apply_edit("keep me", "// ... existing code ...\n"), "");
        assert_eq!(apply_edit("keep me", "// ... existing code ..."), "keep me");
    }

    #[test]
    fn test_python_marker_alone_counts_as_marker() {
        assert_eq!(apply_edit("a", "# ... existing code ...\nb\nc"), "b\nc");
    }
}
