mod tests_validation;
mod tests_wire_form;
