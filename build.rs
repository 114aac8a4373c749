/// 着色器在运行时由 DXC 编译，修改后无需重新构建，但仍让 cargo 跟踪它们，
/// 以便 `tests/` 中读取着色器目录的测试在着色器变化后重新运行。
fn main() {
    println!("cargo:rerun-if-changed=shaders");
}
