use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/** \brief 以解释器方式执行代码、返回执行输出而非 URL 的模板。 */
pub const CODE_INTERPRETER_TEMPLATE: &str = "code-interpreter-v1";

/**
 * \brief 沙箱执行环境元数据。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInfo {
    /** \brief 展示名称 */
    pub name: String,
    /** \brief 预装依赖 */
    pub lib: Vec<String>,
    /** \brief 入口文件 */
    pub file: String,
    /** \brief 面向模型的说明 */
    pub instructions: String,
    /** \brief 默认端口，None 表示不对外服务 */
    #[serde(default)]
    pub port: Option<u16>,
}

fn template(name: &str, lib: &[&str], file: &str, instructions: &str, port: Option<u16>) -> TemplateInfo {
    TemplateInfo {
        name: name.to_string(),
        lib: lib.iter().map(|s| s.to_string()).collect(),
        file: file.to_string(),
        instructions: instructions.to_string(),
        port,
    }
}

static TEMPLATES: Lazy<IndexMap<String, TemplateInfo>> = Lazy::new(|| {
    let mut map = IndexMap::new();
    map.insert(
        CODE_INTERPRETER_TEMPLATE.to_string(),
        template(
            "Python data analyst",
            &["python", "jupyter", "numpy", "pandas", "matplotlib", "seaborn", "plotly"],
            "script.py",
            "Runs code as a Jupyter notebook cell. Strong data analysis angle. Can use complex visualisation to explain results.",
            None,
        ),
    );
    map.insert(
        "nextjs-developer".to_string(),
        template(
            "Next.js developer",
            &[
                "nextjs@14.2.5",
                "typescript",
                "@types/node",
                "@types/react",
                "@types/react-dom",
                "postcss",
                "tailwindcss",
                "shadcn",
            ],
            "pages/index.tsx",
            "A Next.js 13+ app that reloads automatically. Using the pages router.",
            Some(3000),
        ),
    );
    map.insert(
        "vue-developer".to_string(),
        template(
            "Vue.js developer",
            &["vue@latest", "nuxt@3.13.0", "tailwindcss"],
            "app/app.vue",
            "A Vue.js 3+ app that reloads automatically. Only when asked specifically for a Vue app.",
            Some(3000),
        ),
    );
    map.insert(
        "streamlit-developer".to_string(),
        template(
            "Streamlit developer",
            &["streamlit", "pandas", "numpy", "matplotlib", "requests", "seaborn", "plotly"],
            "app.py",
            "A streamlit app that reloads automatically.",
            Some(8501),
        ),
    );
    map.insert(
        "gradio-developer".to_string(),
        template(
            "Gradio developer",
            &["gradio", "pandas", "numpy", "matplotlib", "requests", "seaborn", "plotly"],
            "app.py",
            "A gradio app. Gradio Blocks/Interface should be called demo.",
            Some(7860),
        ),
    );
    map
});

/**
 * \brief 全部已注册模板，保持注册顺序。
 */
pub fn registry() -> &'static IndexMap<String, TemplateInfo> {
    &TEMPLATES
}

pub fn get(id: &str) -> Option<&'static TemplateInfo> {
    TEMPLATES.get(id)
}

/**
 * \brief 只包含单个已注册模板的目录。
 */
pub fn single(id: &str) -> Option<IndexMap<String, TemplateInfo>> {
    let info = get(id)?;
    let mut only = IndexMap::new();
    only.insert(id.to_string(), info.clone());
    Some(only)
}

/**
 * \brief 将模板目录渲染为编号列表。
 */
pub fn templates_to_prompt(templates: &IndexMap<String, TemplateInfo>) -> String {
    templates
        .iter()
        .enumerate()
        .map(|(index, (id, info))| {
            let port = info
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "none".to_string());
            let file = if info.file.is_empty() { "none" } else { info.file.as_str() };
            format!(
                "{}. {}: \"{}\". File: {}. Dependencies installed: {}. Port: {}.",
                index + 1,
                id,
                info.instructions,
                file,
                info.lib.join(", "),
                port
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/**
 * \brief 生成片段的系统提示词。
 */
pub fn to_prompt(templates: &IndexMap<String, TemplateInfo>) -> String {
    format!(
        "You are a skilled software engineer.\n\
         You do not make mistakes.\n\
         Generate a fragment.\n\
         You can install additional dependencies.\n\
         Do not touch project dependencies files like package.json, package-lock.json, requirements.txt, etc.\n\
         Do not wrap code in backticks.\n\
         Always break the lines correctly.\n\
         You can use one of the following templates:\n\
         {}\n",
        templates_to_prompt(templates)
    )
}
